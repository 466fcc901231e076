//! Routes decoded server messages to their handlers.
//!
//! The dispatcher never fails: a malformed frame or unknown message type is
//! logged and skipped, and the session keeps running. Long-running work (jobs,
//! screenshots) is handed off so the session loop is never blocked.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use fleet_core::DeviceIdentity;
use fleet_protocol::{
    AuthFailedPayload, AuthenticatedPayload, ClientMessage, ProtocolError, RegisterPayload,
    RegisteredPayload, ScreenshotPayload, ServerMessage,
};
use tracing::{debug, info, trace, warn};

use crate::config::DeviceProfile;
use crate::credentials::CredentialStore;
use crate::engine::{Engine, UNKNOWN_VERSION};
use crate::error::{AgentError, EngineError};
use crate::executor::JobExecutor;
use crate::outbox::Outbox;
use crate::state::{AgentEvent, AuthState, ConnectionState, SharedState};

pub(crate) struct Dispatcher {
    state: Arc<SharedState>,
    outbox: Outbox,
    executor: Arc<JobExecutor>,
    engine: Option<Arc<dyn Engine>>,
    store: Arc<dyn CredentialStore>,
    device: DeviceProfile,
}

impl Dispatcher {
    pub(crate) fn new(
        state: Arc<SharedState>,
        outbox: Outbox,
        executor: Arc<JobExecutor>,
        engine: Option<Arc<dyn Engine>>,
        store: Arc<dyn CredentialStore>,
        device: DeviceProfile,
    ) -> Self {
        Self {
            state,
            outbox,
            executor,
            engine,
            store,
            device,
        }
    }

    /// Starts the handshake for a fresh session: `auth` with a stored token,
    /// otherwise `register` with a queued bind code, otherwise nothing.
    pub(crate) async fn on_session_start(&self) {
        let token = {
            let identity = self.state.identity.read().await;
            identity
                .has_token()
                .then(|| identity.device_token.clone())
        };

        if let Some(token) = token {
            info!("Authenticating with stored device token");
            self.outbox.send(&ClientMessage::auth(
                token,
                self.engine_version(),
                self.client_version(),
            ));
            self.state.set_auth(AuthState::AwaitingServerAck).await;
            return;
        }

        let pending = self.state.pending_bind_code.lock().await.take();
        match pending {
            Some(code) => self.send_register(&code).await,
            None => info!("Device is not registered, waiting for a bind code"),
        }
    }

    pub(crate) async fn on_session_end(&self) {
        self.state.set_auth(AuthState::Unauthenticated).await;
    }

    /// Registers with `code` now if connected, otherwise on the next session.
    pub(crate) async fn register(&self, code: &str) -> Result<(), AgentError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(AgentError::EmptyBindCode);
        }

        // Held across the connection check so a starting session either sees
        // the queued code or we see it connected.
        let mut pending = self.state.pending_bind_code.lock().await;
        let connection = *self.state.connection.read().await;
        match connection {
            ConnectionState::Connected => {
                pending.take();
                drop(pending);
                self.send_register(code).await;
            }
            ConnectionState::Closed => return Err(AgentError::NotRunning),
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                info!("Not connected, bind code queued for the next session");
                *pending = Some(code.to_string());
            }
        }
        Ok(())
    }

    /// Handles one inbound frame.
    pub(crate) async fn dispatch(&self, frame: &str) {
        let message = match ServerMessage::decode(frame) {
            Ok(message) => message,
            Err(ProtocolError::UnknownKind(kind)) => {
                debug!(kind = %kind, "Ignoring unknown message type");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                return;
            }
        };

        trace!(kind = %message.kind(), "Dispatching server message");

        match message {
            ServerMessage::Registered(payload) => self.handle_registered(payload).await,
            ServerMessage::Authenticated(payload) => self.handle_authenticated(payload).await,
            ServerMessage::AuthFailed(payload) => self.handle_auth_failed(payload).await,
            ServerMessage::Pong => debug!("Heartbeat acknowledged"),
            ServerMessage::RunTask(payload) => {
                self.executor.submit(payload).await;
            }
            ServerMessage::StopTask(payload) => self.executor.stop(&payload.job_id).await,
            ServerMessage::RequestScreenshot(payload) => self.handle_screenshot(payload.request_id),
            ServerMessage::Error(payload) => {
                warn!(code = %payload.code, message = %payload.message, "Server reported an error");
            }
        }
    }

    async fn handle_registered(&self, payload: RegisteredPayload) {
        let identity = DeviceIdentity {
            device_id: payload.device_id,
            device_token: payload.device_token,
        };
        if !identity.has_token() {
            warn!("Server registered the device without a token");
        }
        if let Err(e) = self.store.save(&identity) {
            warn!(error = %e, "Failed to persist device credentials");
        }

        let device_id = identity.device_id.clone();
        *self.state.identity.write().await = identity;
        self.state.set_auth(AuthState::Authenticated).await;
        info!(device_id = %device_id, "Device registered");
        self.state.emit(AgentEvent::Registered { device_id });

        self.send_capabilities().await;
    }

    async fn handle_authenticated(&self, payload: AuthenticatedPayload) {
        if !payload.device_id.is_empty() {
            self.state.identity.write().await.device_id = payload.device_id.clone();
        }
        self.state.set_auth(AuthState::Authenticated).await;
        info!(
            device_id = %payload.device_id,
            user = %payload.user_nickname,
            "Device authenticated"
        );
        self.state.emit(AgentEvent::Authenticated {
            device_id: payload.device_id,
            user_nickname: payload.user_nickname,
        });

        self.send_capabilities().await;
    }

    async fn handle_auth_failed(&self, payload: AuthFailedPayload) {
        let message = if payload.message.is_empty() {
            payload.error
        } else {
            payload.message
        };
        warn!(reason = %message, "Authentication failed, clearing stored credentials");

        self.state.identity.write().await.clear();
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear device credentials");
        }
        self.state.set_auth(AuthState::Unauthenticated).await;
        self.state.emit(AgentEvent::AuthFailed { message });

        // A code entered while the token was being checked can be used now.
        let pending = self.state.pending_bind_code.lock().await.take();
        if let Some(code) = pending {
            self.send_register(&code).await;
        }
    }

    fn handle_screenshot(&self, request_id: String) {
        let engine = self.engine.clone();
        let outbox = self.outbox.clone();

        tokio::spawn(async move {
            let result = match engine {
                Some(engine) => engine.take_screenshot().await,
                None => Err(EngineError::NotInitialized),
            };

            let payload = match result {
                Ok(shot) => {
                    debug!(request_id = %request_id, bytes = shot.data.len(), "Screenshot captured");
                    ScreenshotPayload {
                        request_id,
                        base64_image: STANDARD.encode(&shot.data),
                        width: shot.width,
                        height: shot.height,
                        error: String::new(),
                    }
                }
                Err(e) => {
                    warn!(request_id = %request_id, error = %e, "Screenshot failed");
                    ScreenshotPayload {
                        request_id,
                        error: e.to_string(),
                        ..Default::default()
                    }
                }
            };
            outbox.send(&ClientMessage::Screenshot(payload));
        });
    }

    async fn send_register(&self, code: &str) {
        info!(device_name = %self.device.name, "Registering device with bind code");
        self.outbox.send(&ClientMessage::Register(RegisterPayload {
            bind_code: code.to_string(),
            device_name: self.device.name.clone(),
            engine_version: self.engine_version(),
            client_version: self.client_version(),
            install_path: self.device.install_path.clone(),
            os_info: self.device.os_info.clone(),
        }));
        self.state.set_auth(AuthState::AwaitingServerAck).await;
    }

    async fn send_capabilities(&self) {
        let Some(engine) = &self.engine else {
            warn!("No automation engine, capabilities not reported");
            return;
        };
        match engine.capabilities().await {
            Ok(capabilities) => {
                info!(
                    tasks = capabilities.tasks.len(),
                    controllers = capabilities.controllers.len(),
                    resources = capabilities.resources.len(),
                    "Reporting capabilities"
                );
                self.outbox.send(&ClientMessage::Capabilities(capabilities));
            }
            Err(e) => warn!(error = %e, "Failed to read engine capabilities"),
        }
    }

    fn engine_version(&self) -> String {
        self.engine
            .as_ref()
            .map_or_else(|| UNKNOWN_VERSION.to_string(), |engine| engine.version())
    }

    fn client_version(&self) -> String {
        if self.device.client_version.trim().is_empty() {
            UNKNOWN_VERSION.to_string()
        } else {
            self.device.client_version.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::credentials::MemoryCredentialStore;
    use crate::engine::ScriptedEngine;
    use crate::outbox::OutboxReceiver;
    use fleet_core::{DeviceId, DeviceToken};
    use fleet_protocol::{AuthPayload, MessageKind};

    struct Fixture {
        dispatcher: Dispatcher,
        state: Arc<SharedState>,
        store: Arc<MemoryCredentialStore>,
        rx: OutboxReceiver,
    }

    fn fixture(identity: DeviceIdentity, engine: Option<Arc<dyn Engine>>) -> Fixture {
        let state = Arc::new(SharedState::new(identity.clone(), None));
        let store = Arc::new(MemoryCredentialStore::new(identity));
        let (outbox, rx) = Outbox::new(64);
        let executor = Arc::new(JobExecutor::new(
            engine.clone(),
            outbox.clone(),
            ExecutorConfig::default(),
        ));
        let dispatcher = Dispatcher::new(
            state.clone(),
            outbox,
            executor,
            engine,
            store.clone(),
            DeviceProfile {
                name: "lab-pc".to_string(),
                client_version: "0.3.0".to_string(),
                install_path: "/opt/engine".to_string(),
                os_info: "linux x86_64".to_string(),
            },
        );
        Fixture {
            dispatcher,
            state,
            store,
            rx,
        }
    }

    fn next(rx: &mut OutboxReceiver) -> ClientMessage {
        ClientMessage::decode(&rx.try_recv().unwrap()).unwrap()
    }

    fn frame(message: &ServerMessage) -> String {
        message.encode().unwrap()
    }

    #[tokio::test]
    async fn test_session_start_with_token_sends_auth() {
        let engine: Arc<dyn Engine> = Arc::new(ScriptedEngine::new().with_version("5.1"));
        let mut f = fixture(DeviceIdentity::new("d1", "t1"), Some(engine));

        f.dispatcher.on_session_start().await;

        assert_eq!(
            next(&mut f.rx),
            ClientMessage::Auth(AuthPayload {
                device_token: DeviceToken::new("t1"),
                engine_version: "5.1".to_string(),
                client_version: "0.3.0".to_string(),
            })
        );
        assert_eq!(*f.state.auth.read().await, AuthState::AwaitingServerAck);
    }

    #[tokio::test]
    async fn test_session_start_without_token_or_code_sends_nothing() {
        let mut f = fixture(DeviceIdentity::default(), None);
        f.dispatcher.on_session_start().await;
        assert!(f.rx.try_recv().is_err());
        assert_eq!(*f.state.auth.read().await, AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_register_queues_until_connected() {
        let mut f = fixture(DeviceIdentity::default(), None);

        assert_eq!(
            f.dispatcher.register("  ").await,
            Err(AgentError::EmptyBindCode)
        );
        f.dispatcher.register("ABC123").await.unwrap();
        assert!(f.rx.try_recv().is_err());

        f.state.set_connection(ConnectionState::Connected).await;
        f.dispatcher.on_session_start().await;

        match next(&mut f.rx) {
            ClientMessage::Register(payload) => {
                assert_eq!(payload.bind_code, "ABC123");
                assert_eq!(payload.device_name, "lab-pc");
                assert_eq!(payload.engine_version, UNKNOWN_VERSION);
                assert_eq!(payload.os_info, "linux x86_64");
            }
            other => panic!("expected register, got {other:?}"),
        }
        assert!(f.state.pending_bind_code.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_registered_persists_identity_and_reports_capabilities() {
        let engine: Arc<dyn Engine> = Arc::new(ScriptedEngine::new());
        let mut f = fixture(DeviceIdentity::default(), Some(engine));

        f.dispatcher
            .dispatch(&frame(&ServerMessage::Registered(RegisteredPayload {
                device_id: DeviceId::new("d9"),
                device_token: DeviceToken::new("t9"),
            })))
            .await;

        assert_eq!(f.store.snapshot(), DeviceIdentity::new("d9", "t9"));
        assert_eq!(*f.state.auth.read().await, AuthState::Authenticated);
        assert_eq!(next(&mut f.rx).kind(), MessageKind::Capabilities);
    }

    #[tokio::test]
    async fn test_auth_failed_clears_credentials() {
        let mut f = fixture(DeviceIdentity::new("d1", "t1"), None);

        f.dispatcher
            .dispatch(&frame(&ServerMessage::AuthFailed(AuthFailedPayload {
                error: "invalid_token".to_string(),
                message: String::new(),
            })))
            .await;

        assert!(!f.store.snapshot().has_token());
        assert!(!f.state.identity.read().await.has_token());
        assert_eq!(*f.state.auth.read().await, AuthState::Unauthenticated);
        assert!(f.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_garbage_and_unknown_frames_are_ignored() {
        let mut f = fixture(DeviceIdentity::default(), None);
        f.dispatcher.dispatch("not json").await;
        f.dispatcher
            .dispatch(r#"{"type":"firmware_update","payload":{}}"#)
            .await;
        f.dispatcher.dispatch(r#"{"type":"pong"}"#).await;
        assert!(f.rx.try_recv().is_err());
    }
}
