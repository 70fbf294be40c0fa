//! Actor-Frontend für den Voice-Core
//!
//! `VoiceService` besitzt den `VoiceCoordinator` und verarbeitet Kommandos,
//! Signaling-Events und interne Events strikt nacheinander. `VoiceHandle` ist
//! der klonbare Zugang dazu; Abfragen lesen den zuletzt veröffentlichten
//! `VoiceSnapshot`.

use super::coordinator::{VoiceCoordinator, VoiceError};
use super::peer::BundleKind;
use super::snapshot::{BundleSnapshot, PeerSnapshot, SessionSnapshot, VoiceSnapshot};
use crate::media::{DeviceKind, MediaDevice, MediaStream, VideoConstraints};
use crate::signaling::SignalingEvent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

type Reply<T> = oneshot::Sender<Result<T, VoiceError>>;

enum Command {
    Join { channel_id: String, reply: Reply<()> },
    Leave { reply: Reply<()> },
    ToggleMic { reply: Reply<bool> },
    ToggleDeafen { reply: Reply<bool> },
    StartCamera { constraints: VideoConstraints, reply: Reply<()> },
    StartScreenShare { constraints: VideoConstraints, reply: Reply<()> },
    SetVideoStream { stream: Option<MediaStream>, reply: Reply<()> },
    EnumerateDevices { kind: DeviceKind, reply: Reply<Vec<MediaDevice>> },
    Signaling(SignalingEvent),
    Shutdown { reply: oneshot::Sender<()> },
}

// ============================================================================
// SERVICE
// ============================================================================

pub struct VoiceService {
    coordinator: VoiceCoordinator,
    commands: mpsc::Receiver<Command>,
    transition: Arc<AtomicBool>,
}

impl VoiceService {
    /// Startet den Service-Task und gibt den Handle zurück
    pub fn spawn(coordinator: VoiceCoordinator) -> (VoiceHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let transition = Arc::new(AtomicBool::new(false));
        let handle = VoiceHandle {
            commands: tx,
            snapshot: coordinator.subscribe(),
            transition: Arc::clone(&transition),
        };
        let service = Self {
            coordinator,
            commands: rx,
            transition,
        };
        (handle, tokio::spawn(service.run()))
    }

    async fn run(mut self) {
        let mut purge = tokio::time::interval(self.coordinator.config().early_signal_ttl());

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        // Alle Handles weg
                        if let Err(e) = self.coordinator.leave_channel().await {
                            tracing::warn!("Leave on shutdown failed: {}", e);
                        }
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(event) = self.coordinator.next_event() => {
                    self.coordinator.handle_event(event).await;
                }
                _ = purge.tick() => {
                    self.coordinator.purge_early_signals();
                }
            }
        }

        tracing::info!("Voice service stopped");
    }

    /// Gibt `false` zurück wenn der Service beendet werden soll
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Join { channel_id, reply } => {
                let result = self.coordinator.join_channel(&channel_id).await;
                self.transition.store(false, Ordering::Release);
                let _ = reply.send(result);
            }
            Command::Leave { reply } => {
                let result = self.coordinator.leave_channel().await;
                self.transition.store(false, Ordering::Release);
                let _ = reply.send(result);
            }
            Command::ToggleMic { reply } => {
                let _ = reply.send(self.coordinator.toggle_mic().await);
            }
            Command::ToggleDeafen { reply } => {
                let _ = reply.send(self.coordinator.toggle_deafen());
            }
            Command::StartCamera { constraints, reply } => {
                let _ = reply.send(self.coordinator.start_camera(&constraints).await);
            }
            Command::StartScreenShare { constraints, reply } => {
                let _ = reply.send(self.coordinator.start_screen_share(&constraints).await);
            }
            Command::SetVideoStream { stream, reply } => {
                let _ = reply.send(self.coordinator.set_video_stream(stream).await);
            }
            Command::EnumerateDevices { kind, reply } => {
                let _ = reply.send(self.coordinator.enumerate_devices(kind).await);
            }
            Command::Signaling(event) => {
                self.coordinator.handle_signaling(event).await;
            }
            Command::Shutdown { reply } => {
                if let Err(e) = self.coordinator.leave_channel().await {
                    tracing::warn!("Leave on shutdown failed: {}", e);
                }
                let _ = reply.send(());
                return false;
            }
        }
        true
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// Klonbarer Zugang zum laufenden `VoiceService`
#[derive(Clone)]
pub struct VoiceHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<VoiceSnapshot>,
    transition: Arc<AtomicBool>,
}

impl VoiceHandle {
    pub async fn join_channel(&self, channel_id: &str) -> Result<(), VoiceError> {
        self.transition(|reply| Command::Join {
            channel_id: channel_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn leave_channel(&self) -> Result<(), VoiceError> {
        self.transition(|reply| Command::Leave { reply }).await
    }

    pub async fn toggle_mic(&self) -> Result<bool, VoiceError> {
        self.request(|reply| Command::ToggleMic { reply }).await
    }

    pub async fn toggle_deafen(&self) -> Result<bool, VoiceError> {
        self.request(|reply| Command::ToggleDeafen { reply }).await
    }

    pub async fn start_camera(&self, constraints: VideoConstraints) -> Result<(), VoiceError> {
        self.request(|reply| Command::StartCamera { constraints, reply })
            .await
    }

    pub async fn start_screen_share(&self, constraints: VideoConstraints) -> Result<(), VoiceError> {
        self.request(|reply| Command::StartScreenShare { constraints, reply })
            .await
    }

    pub async fn set_video_stream(&self, stream: Option<MediaStream>) -> Result<(), VoiceError> {
        self.request(|reply| Command::SetVideoStream { stream, reply })
            .await
    }

    pub async fn stop_video(&self) -> Result<(), VoiceError> {
        self.set_video_stream(None).await
    }

    pub async fn enumerate_devices(&self, kind: DeviceKind) -> Result<Vec<MediaDevice>, VoiceError> {
        self.request(|reply| Command::EnumerateDevices { kind, reply })
            .await
    }

    /// Reicht ein Signaling-Event an den Service weiter
    pub async fn signaling(&self, event: SignalingEvent) -> Result<(), VoiceError> {
        self.commands
            .send(Command::Signaling(event))
            .await
            .map_err(|_| VoiceError::ServiceStopped)
    }

    /// Leitet alle Events eines `SignalingClient` an den Service weiter
    pub fn forward_signaling(&self, mut events: broadcast::Receiver<SignalingEvent>) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if handle.signaling(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Signaling forwarder lagged, {} events lost", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Verlässt den Channel und beendet den Service
    pub async fn shutdown(&self) -> Result<(), VoiceError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { reply: tx })
            .await
            .map_err(|_| VoiceError::ServiceStopped)?;
        rx.await.map_err(|_| VoiceError::ServiceStopped)
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn snapshot(&self) -> VoiceSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Wartet auf den nächsten veröffentlichten Snapshot
    pub fn subscribe(&self) -> watch::Receiver<VoiceSnapshot> {
        self.snapshot.clone()
    }

    pub fn current_session(&self) -> Option<SessionSnapshot> {
        self.snapshot.borrow().current_session().cloned()
    }

    pub fn roster_for(&self, channel_id: &str) -> Vec<PeerSnapshot> {
        self.snapshot.borrow().roster_for(channel_id).to_vec()
    }

    pub fn is_mic_muted(&self) -> bool {
        self.snapshot.borrow().is_mic_muted()
    }

    pub fn is_deafened(&self) -> bool {
        self.snapshot.borrow().is_deafened()
    }

    pub fn local_voice_activity(&self) -> bool {
        self.snapshot.borrow().local_voice_activity()
    }

    pub fn remote_voice_activity(&self, user_id: &str) -> bool {
        self.snapshot.borrow().remote_voice_activity(user_id)
    }

    pub fn active_bundle(&self, user_id: &str, kind: BundleKind) -> Option<BundleSnapshot> {
        self.snapshot.borrow().active_bundle(user_id, kind).cloned()
    }

    pub fn mic_enabled(&self, user_id: &str) -> bool {
        self.snapshot.borrow().mic_enabled(user_id)
    }

    pub fn video_enabled(&self, user_id: &str) -> bool {
        self.snapshot.borrow().video_enabled(user_id)
    }

    pub fn voice_activity(&self, user_id: &str) -> bool {
        self.snapshot.borrow().voice_activity(user_id)
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, VoiceError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| VoiceError::ServiceStopped)?;
        rx.await.map_err(|_| VoiceError::ServiceStopped)?
    }

    /// Join/Leave: wird abgelehnt solange ein anderer Wechsel läuft
    async fn transition(&self, command: impl FnOnce(Reply<()>) -> Command) -> Result<(), VoiceError> {
        if self.transition.swap(true, Ordering::AcqRel) {
            return Err(VoiceError::TransitionInProgress);
        }
        let (tx, rx) = oneshot::channel();
        if self.commands.send(command(tx)).await.is_err() {
            self.transition.store(false, Ordering::Release);
            return Err(VoiceError::ServiceStopped);
        }
        // Der Service setzt das Flag nach der Verarbeitung zurück
        rx.await.map_err(|_| VoiceError::ServiceStopped)?
    }
}

impl std::fmt::Debug for VoiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceHandle")
            .field("transition", &self.transition.load(Ordering::Relaxed))
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{coordinator, remote_track, Fakes};
    use crate::media::TrackKind;
    use crate::transport::TransportEvent;
    use std::time::Duration;

    fn spawn(local: &str) -> (VoiceHandle, JoinHandle<()>, Fakes) {
        let (coordinator, fakes) = coordinator(local);
        let (handle, task) = VoiceService::spawn(coordinator);
        (handle, task, fakes)
    }

    async fn wait_for<F>(handle: &VoiceHandle, predicate: F)
    where
        F: Fn(&VoiceSnapshot) -> bool,
    {
        let mut rx = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| predicate(s)))
            .await
            .expect("timed out waiting for snapshot")
            .expect("service stopped");
    }

    #[tokio::test]
    async fn test_join_and_query_through_handle() {
        let (handle, _task, fakes) = spawn("alice");
        handle
            .signaling(SignalingEvent::JoinedVoice {
                channel_id: "c1".to_string(),
                user_id: "bob".to_string(),
            })
            .await
            .unwrap();

        handle.join_channel("c1").await.unwrap();
        assert_eq!(handle.current_session().unwrap().channel_id, "c1");
        assert!(handle.is_mic_muted());
        assert_eq!(handle.roster_for("c1").len(), 1);
        assert!(handle.roster_for("c1")[0].has_transport);

        assert!(handle.toggle_mic().await.unwrap());
        assert!(!handle.is_mic_muted());
        assert!(handle.mic_enabled("alice"));

        fakes.transports.last().emit(TransportEvent::Track {
            track: remote_track(TrackKind::Audio, "t1"),
            stream_id: "s1".to_string(),
        });
        wait_for(&handle, |s| s.active_bundle("bob", BundleKind::Audio).is_some()).await;

        handle.leave_channel().await.unwrap();
        assert!(handle.current_session().is_none());
        assert_eq!(fakes.transports.live(), 0);
        assert_eq!(fakes.vads.live(), 0);
    }

    #[tokio::test]
    async fn test_transition_in_flight_rejects_join_and_leave() {
        let (handle, _task, fakes) = spawn("alice");
        let (entered, release) = fakes.relay.gate_joins();

        let joining = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.join_channel("c1").await })
        };
        entered.notified().await;

        assert!(matches!(
            handle.leave_channel().await,
            Err(VoiceError::TransitionInProgress)
        ));
        assert!(matches!(
            handle.join_channel("c2").await,
            Err(VoiceError::TransitionInProgress)
        ));

        release.notify_one();
        joining.await.unwrap().unwrap();

        *fakes.relay.join_gate.lock() = None;
        handle.leave_channel().await.unwrap();
        assert!(handle.current_session().is_none());
    }

    #[tokio::test]
    async fn test_leave_completes_before_next_join() {
        let (handle, _task, fakes) = spawn("alice");
        for user in ["bob", "carol"] {
            handle
                .signaling(SignalingEvent::JoinedVoice {
                    channel_id: "c1".to_string(),
                    user_id: user.to_string(),
                })
                .await
                .unwrap();
        }
        handle.join_channel("c1").await.unwrap();
        assert_eq!(fakes.transports.created().len(), 2);

        handle.leave_channel().await.unwrap();
        assert!(handle.current_session().is_none());
        assert_eq!(fakes.transports.live(), 0);

        handle.join_channel("c2").await.unwrap();
        assert_eq!(handle.current_session().unwrap().channel_id, "c2");
    }

    #[tokio::test]
    async fn test_forward_signaling_and_shutdown() {
        let (handle, task, fakes) = spawn("alice");
        let (tx, rx) = broadcast::channel(16);
        let forwarder = handle.forward_signaling(rx);

        handle.join_channel("c1").await.unwrap();
        tx.send(SignalingEvent::JoinedVoice {
            channel_id: "c1".to_string(),
            user_id: "bob".to_string(),
        })
        .unwrap();
        wait_for(&handle, |s| s.roster_for("c1").len() == 1).await;
        assert_eq!(fakes.transports.live(), 1);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert_eq!(fakes.transports.live(), 0);
        assert!(matches!(
            handle.toggle_mic().await,
            Err(VoiceError::ServiceStopped)
        ));

        drop(tx);
        forwarder.await.unwrap();
    }
}
