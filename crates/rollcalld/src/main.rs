//! rollcalld - classroom presence monitoring service
//!
//! This is the main entry point for the rollcalld service.
//! It wires together all the components:
//! - Configuration loading and hot reload
//! - Store (SQLite behind a write-behind queue)
//! - Presence engine, restart recovery and the scheduler tick
//! - Relay live feed and alert delivery
//! - IPC server for dashboards and the button bridge

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rollcall_api::{
    Command, ErrorCode, ErrorInfo, Event, EventPayload, Response, ResponsePayload,
};
use rollcall_channel_api::{Notifier, RelayMessage, RelaySource};
use rollcall_channels::{ConfiguredCalendar, DiscordNotifier, SlackRelay, UnconfiguredNotifier};
use rollcall_config::load_config;
use rollcall_core::{
    deliver, recover, seed_students, CoreEvent, DeliveryIntent, EngineContext, IngestMode,
    PresenceEngine, RetryPolicy,
};
use rollcall_ipc::{IpcServer, ServerMessage};
use rollcall_store::{AuditEvent, AuditEventType, SqliteStore, Store, WriteBehindStore};
use rollcall_util::{default_config_path, ClientId, RollcallError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// rollcalld - Classroom presence monitoring and camera-off alerts
#[derive(Parser, Debug)]
#[command(name = "rollcalld")]
#[command(about = "Classroom presence monitoring and camera-off alerts", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/rollcall/config.toml)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Socket path override (or set ROLLCALL_SOCKET env var)
    #[arg(short, long, env = "ROLLCALL_SOCKET")]
    socket: Option<PathBuf>,

    /// Data directory override (or set ROLLCALL_DATA_DIR env var)
    #[arg(short, long, env = "ROLLCALL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level; RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Sends in flight, each handing its intent back with the outcome
type Deliveries = JoinSet<(DeliveryIntent, std::result::Result<(), String>)>;

/// Main service state
struct Service {
    config_path: PathBuf,
    engine: Arc<Mutex<PresenceEngine>>,
    registry: Arc<SqliteStore>,
    store: Arc<WriteBehindStore>,
    calendar: Arc<ConfiguredCalendar>,
    notifier: Arc<dyn Notifier>,
    relay: Option<Arc<SlackRelay>>,
    retry: RetryPolicy,
    ipc: Arc<IpcServer>,
    shutdown_grace: Duration,
}

impl Service {
    async fn new(args: &Args) -> Result<Self> {
        let policy = load_config(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?;

        info!(
            config_path = %args.config.display(),
            seed_students = policy.students.len(),
            relay = policy.relay.is_some(),
            notifier = policy.notifier.is_some(),
            "Configuration loaded"
        );

        let socket_path = args
            .socket
            .clone()
            .unwrap_or_else(|| policy.service.socket_path.clone());

        let data_dir = args
            .data_dir
            .clone()
            .unwrap_or_else(|| policy.service.data_dir.clone());

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

        let db_path = data_dir.join("rollcalld.db");
        let registry = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database {:?}", db_path))?,
        );
        let (store, _writer) = WriteBehindStore::spawn(registry.clone());
        let store = Arc::new(store);

        info!(db_path = %db_path.display(), "Store initialized");

        store.append_audit(AuditEvent::new(AuditEventType::ServiceStarted))?;

        if let Err(e) = seed_students(registry.as_ref(), &policy.students) {
            warn!(error = %e, "Failed to import seed roster");
        }

        let calendar = Arc::new(ConfiguredCalendar::new(policy.calendar.clone()));

        let notifier: Arc<dyn Notifier> = match &policy.notifier {
            Some(config) => match DiscordNotifier::new(config) {
                Ok(notifier) => {
                    info!(admin_channel = %config.admin_channel, "Notifier initialized");
                    Arc::new(notifier)
                }
                Err(e) => {
                    warn!(error = %e, "Notifier unavailable, alerts will fail until fixed");
                    Arc::new(UnconfiguredNotifier)
                }
            },
            None => {
                warn!("No notifier configured, alerts cannot be delivered");
                Arc::new(UnconfiguredNotifier)
            }
        };

        let relay = match &policy.relay {
            Some(config) => match SlackRelay::new(config) {
                Ok(relay) => {
                    info!(presence_channel = %config.presence_channel, "Relay initialized");
                    Some(Arc::new(relay))
                }
                Err(e) => {
                    warn!(error = %e, "Relay unavailable, running without live events");
                    None
                }
            },
            None => {
                warn!("No relay configured, running without live events");
                None
            }
        };
        let retry = policy
            .relay
            .as_ref()
            .map(RetryPolicy::from_relay)
            .unwrap_or_default();

        let ctx = EngineContext {
            registry: registry.clone(),
            store: store.clone(),
            calendar: calendar.clone(),
            notifier: notifier.clone(),
        };
        let engine = PresenceEngine::new(
            ctx,
            policy.monitor.clone(),
            policy.service.warmup,
            rollcall_util::now(),
        )
        .context("Failed to initialize presence engine")?;

        let mut ipc = IpcServer::new(&socket_path);
        ipc.start().await?;

        info!(socket_path = %socket_path.display(), "IPC server started");

        Ok(Self {
            config_path: args.config.clone(),
            engine: Arc::new(Mutex::new(engine)),
            registry,
            store,
            calendar,
            notifier,
            relay,
            retry,
            ipc: Arc::new(ipc),
            shutdown_grace: policy.service.shutdown_grace,
        })
    }

    async fn run(self) -> Result<()> {
        let mut ipc_messages = self
            .ipc
            .take_message_receiver()
            .await
            .context("IPC message receiver already taken")?;

        let ipc_accept = self.ipc.clone();
        tokio::spawn(async move {
            if let Err(e) = ipc_accept.run().await {
                error!(error = %e, "IPC server error");
            }
        });

        // Rebuild today's presence before anything is evaluated
        let started = rollcall_util::now();
        let report = {
            let mut engine = self.engine.lock().await;
            let relay = self.relay.as_deref().map(|r| r as &dyn RelaySource);
            recover(&mut engine, relay, &self.retry, started).await
        };
        info!(
            boundary = %report.boundary,
            fetched = report.fetched,
            replayed = report.replayed,
            history_available = report.history_available,
            "Startup recovery finished"
        );
        self.broadcast(report.events);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut live_feed = match &self.relay {
            Some(relay) => match relay.subscribe() {
                Ok(rx) => {
                    relay.spawn_live_feed(started, shutdown_rx.clone());
                    Some(rx)
                }
                Err(e) => {
                    warn!(error = %e, "Could not subscribe to the relay feed");
                    None
                }
            },
            None => None,
        };

        let mut sigterm = signal(SignalKind::terminate())
            .context("Failed to create SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt())
            .context("Failed to create SIGINT handler")?;
        let mut sighup = signal(SignalKind::hangup())
            .context("Failed to create SIGHUP handler")?;

        let mut check_interval = self.engine.lock().await.policy().check_interval;
        let mut tick_timer = tick_interval(check_interval);
        let mut deliveries = Deliveries::new();

        info!(check_interval = ?check_interval, "Service running");

        loop {
            let mut reloaded = false;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    break;
                }

                // SIGHUP: re-read the configuration
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading configuration");
                    reloaded = self.reload_config().await.is_ok();
                }

                _ = tick_timer.tick() => {
                    let now = rollcall_util::now();
                    let outcome = self.engine.lock().await.tick(now);
                    if let Some(skip) = outcome.skipped {
                        debug!(reason = skip.as_str(), "Tick skipped");
                    }
                    for intent in outcome.deliveries {
                        self.spawn_delivery(&mut deliveries, intent);
                    }
                    self.broadcast(outcome.events);
                }

                Some(message) = next_live(&mut live_feed) => {
                    let events = self
                        .engine
                        .lock()
                        .await
                        .handle_message(&message, IngestMode::Live);
                    self.broadcast(events);
                }

                Some(joined) = deliveries.join_next(), if !deliveries.is_empty() => {
                    match joined {
                        Ok((intent, result)) => {
                            let events = self.engine.lock().await.complete_delivery(intent, result);
                            self.broadcast(events);
                        }
                        Err(e) => error!(error = %e, "Delivery task failed"),
                    }
                }

                Some(msg) = ipc_messages.recv() => {
                    reloaded = self.handle_ipc_message(msg).await;
                }
            }

            if reloaded {
                let period = self.engine.lock().await.policy().check_interval;
                if period != check_interval {
                    info!(check_interval = ?period, "Check interval changed");
                    check_interval = period;
                    tick_timer = tick_interval(period);
                }
            }
        }

        info!("Shutting down rollcalld");
        let _ = shutdown_tx.send(true);
        self.ipc.broadcast_event(Event::new(EventPayload::Shutdown));

        // In-flight sends get the grace period; nothing new is planned
        if !deliveries.is_empty() {
            let pending = deliveries.len();
            let drain = async {
                while let Some(joined) = deliveries.join_next().await {
                    if let Ok((intent, result)) = joined {
                        let events = self.engine.lock().await.complete_delivery(intent, result);
                        self.broadcast(events);
                    }
                }
            };
            if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
                warn!(pending, "Grace period elapsed, abandoning in-flight alerts");
                deliveries.abort_all();
            }
        }

        if let Err(e) = self
            .store
            .append_audit(AuditEvent::new(AuditEventType::ServiceStopped))
        {
            warn!(error = %e, "Failed to log service shutdown");
        }

        match tokio::time::timeout(self.shutdown_grace, self.store.flush()).await {
            Ok(Ok(())) => debug!("Store writes flushed"),
            Ok(Err(e)) => warn!(error = %e, "Failed to flush store writes"),
            Err(_) => warn!("Timed out flushing store writes"),
        }

        self.ipc.shutdown();
        info!("Shutdown complete");
        Ok(())
    }

    fn spawn_delivery(&self, deliveries: &mut Deliveries, mut intent: DeliveryIntent) {
        let notifier = self.notifier.clone();
        deliveries.spawn(async move {
            let result = deliver(notifier.as_ref(), &mut intent)
                .await
                .map_err(|e| e.to_string());
            (intent, result)
        });
    }

    fn broadcast(&self, events: Vec<CoreEvent>) {
        for event in events {
            self.ipc.broadcast_event(to_event(event));
        }
    }

    /// Re-read the config file and swap in the new monitor policy.
    /// Process-level settings and adapter endpoints need a restart.
    async fn reload_config(&self) -> std::result::Result<(), String> {
        let now = rollcall_util::now();

        let policy = match load_config(&self.config_path) {
            Ok(policy) => policy,
            Err(e) => {
                warn!(error = %e, "Configuration reload failed, keeping previous policy");
                let _ = self.store.append_audit(AuditEvent::at(
                    AuditEventType::ConfigReloaded { success: false },
                    now,
                ));
                return Err(e.to_string());
            }
        };

        self.calendar.replace(policy.calendar.clone());
        if let Err(e) = seed_students(self.registry.as_ref(), &policy.students) {
            warn!(error = %e, "Failed to import seed roster");
        }

        let event = {
            let mut engine = self.engine.lock().await;
            if let Err(e) = engine.refresh_roster() {
                warn!(error = %e, "Failed to refresh roster");
            }
            engine.reload_policy(policy.monitor, now)
        };
        self.broadcast(vec![event]);

        info!(config_path = %self.config_path.display(), "Configuration reloaded");
        Ok(())
    }

    /// Returns whether the message reloaded the configuration
    async fn handle_ipc_message(&self, msg: ServerMessage) -> bool {
        match msg {
            ServerMessage::Request { client_id, request } => {
                let reload = matches!(request.command, Command::ReloadConfig);
                let response = self
                    .handle_command(&client_id, request.request_id, request.command)
                    .await;
                let accepted = matches!(response.result, rollcall_api::ResponseResult::Ok(_));

                let _ = self.ipc.send_response(&client_id, response).await;
                reload && accepted
            }

            ServerMessage::ClientConnected { client_id, info } => {
                info!(
                    client_id = %client_id,
                    role = ?info.role,
                    uid = ?info.uid,
                    "Client connected"
                );

                let _ = self.store.append_audit(AuditEvent::new(
                    AuditEventType::ClientConnected {
                        client_id: client_id.to_string(),
                        role: format!("{:?}", info.role),
                        uid: info.uid,
                    },
                ));
                false
            }

            ServerMessage::ClientDisconnected { client_id } => {
                debug!(client_id = %client_id, "Client disconnected");

                let _ = self.store.append_audit(AuditEvent::new(
                    AuditEventType::ClientDisconnected {
                        client_id: client_id.to_string(),
                    },
                ));
                false
            }
        }
    }

    async fn handle_command(
        &self,
        client_id: &ClientId,
        request_id: u64,
        command: Command,
    ) -> Response {
        if command.requires_admin() {
            let admin = self
                .ipc
                .get_client_info(client_id)
                .await
                .is_some_and(|info| info.role.can_administer());
            if !admin {
                return Response::error(
                    request_id,
                    ErrorInfo::new(ErrorCode::PermissionDenied, "Admin role required"),
                );
            }
        }

        let now = rollcall_util::now();

        match command {
            Command::GetState => {
                let snapshot = self.engine.lock().await.snapshot(now);
                Response::success(request_id, ResponsePayload::State(snapshot))
            }

            Command::ListStudents => {
                let students = self.engine.lock().await.list_students(now);
                Response::success(request_id, ResponsePayload::Students { students })
            }

            Command::GetOverview => {
                let overview = self.engine.lock().await.overview(now);
                Response::success(request_id, ResponsePayload::Overview(overview))
            }

            Command::RespondToAlert { alert_id, choice } => {
                let result = self
                    .engine
                    .lock()
                    .await
                    .apply_response(alert_id, choice, now);
                match result {
                    Ok(events) => {
                        self.broadcast(events);
                        Response::success(request_id, ResponsePayload::ResponseAccepted)
                    }
                    Err(e) => {
                        warn!(%alert_id, choice = choice.as_str(), error = %e, "Rejected alert response");
                        error_response(request_id, &e)
                    }
                }
            }

            Command::SetStatus {
                student_id,
                kind,
                start,
                end,
                reason,
            } => {
                let mut engine = self.engine.lock().await;
                let result = engine
                    .set_status(student_id, kind, start, end, reason, now)
                    .and_then(|events| Ok((events, engine.student_view(student_id, now)?)));
                drop(engine);

                match result {
                    Ok((events, view)) => {
                        self.broadcast(events);
                        Response::success(request_id, ResponsePayload::StatusUpdated(view))
                    }
                    Err(e) => error_response(request_id, &e),
                }
            }

            Command::ClearStatus { student_id } => {
                let mut engine = self.engine.lock().await;
                let result = engine
                    .clear_status(student_id, now)
                    .and_then(|events| Ok((events, engine.student_view(student_id, now)?)));
                drop(engine);

                match result {
                    Ok((events, view)) => {
                        self.broadcast(events);
                        Response::success(request_id, ResponsePayload::StatusUpdated(view))
                    }
                    Err(e) => error_response(request_id, &e),
                }
            }

            Command::SetMonitoringPaused { paused } => {
                let event = self.engine.lock().await.set_monitoring_paused(paused);
                self.broadcast(vec![event]);
                Response::success(request_id, ResponsePayload::MonitoringPaused { paused })
            }

            Command::SetNotificationsPaused { paused } => {
                let event = self.engine.lock().await.set_notifications_paused(paused);
                self.broadcast(vec![event]);
                Response::success(request_id, ResponsePayload::NotificationsPaused { paused })
            }

            Command::ReloadConfig => match self.reload_config().await {
                Ok(()) => Response::success(request_id, ResponsePayload::ConfigReloaded),
                Err(message) => Response::error(
                    request_id,
                    ErrorInfo::new(ErrorCode::ConfigError, message),
                ),
            },

            Command::SubscribeEvents => Response::success(
                request_id,
                ResponsePayload::Subscribed {
                    client_id: client_id.clone(),
                },
            ),

            Command::UnsubscribeEvents => {
                Response::success(request_id, ResponsePayload::Unsubscribed)
            }

            Command::GetHealth => {
                let health = self.engine.lock().await.health();
                Response::success(request_id, ResponsePayload::Health(health))
            }

            Command::Ping => Response::success(request_id, ResponsePayload::Pong),
        }
    }
}

fn tick_interval(period: Duration) -> Interval {
    let mut timer = tokio::time::interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

/// Next live relay message; pends forever without a relay
async fn next_live(
    feed: &mut Option<mpsc::UnboundedReceiver<RelayMessage>>,
) -> Option<RelayMessage> {
    match feed {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn to_event(event: CoreEvent) -> Event {
    let payload = match event {
        CoreEvent::StudentChanged(view) => EventPayload::StudentChanged(view),
        CoreEvent::AlertSent {
            alert_id,
            student_id,
            kind,
            audience,
            stage,
        } => EventPayload::AlertSent {
            alert_id,
            student_id,
            kind,
            audience,
            stage,
        },
        CoreEvent::AlertFailed {
            student_id,
            kind,
            error,
        } => EventPayload::AlertFailed {
            student_id,
            kind,
            error,
        },
        CoreEvent::DailyReset { date } => EventPayload::DailyReset { date },
        CoreEvent::RecoveryCompleted {
            replayed,
            history_available,
        } => EventPayload::RecoveryCompleted {
            replayed,
            history_available,
        },
        CoreEvent::MonitoringPaused { paused } => EventPayload::MonitoringPaused { paused },
        CoreEvent::NotificationsPaused { paused } => EventPayload::NotificationsPaused { paused },
        CoreEvent::PolicyReloaded => EventPayload::ConfigReloaded,
        CoreEvent::Overview(overview) => EventPayload::Overview(overview),
    };
    Event::new(payload)
}

fn error_response(request_id: u64, error: &RollcallError) -> Response {
    let code = match error {
        RollcallError::StudentNotFound(_) => ErrorCode::StudentNotFound,
        RollcallError::UnknownAlert => ErrorCode::UnknownAlert,
        RollcallError::ChoiceNotOffered(_) | RollcallError::ValidationError(_) => {
            ErrorCode::InvalidRequest
        }
        RollcallError::StoreError(_) => ErrorCode::InternalError,
    };
    Response::error(request_id, ErrorInfo::new(code, error.to_string()))
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "rollcalld starting"
    );

    let service = Service::new(&args).await?;
    service.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_api::DashboardOverview;
    use rollcall_util::StudentId;

    #[test]
    fn args_parse_with_overrides() {
        let args = Args::parse_from([
            "rollcalld",
            "--config",
            "/tmp/rollcall.toml",
            "--log-format",
            "json",
            "--socket",
            "/tmp/rollcalld.sock",
        ]);
        assert_eq!(args.config, PathBuf::from("/tmp/rollcall.toml"));
        assert_eq!(args.log_format, LogFormat::Json);
        assert_eq!(args.socket, Some(PathBuf::from("/tmp/rollcalld.sock")));
    }

    #[test]
    fn core_events_map_to_wire_events() {
        let event = to_event(CoreEvent::Overview(DashboardOverview::default()));
        assert!(matches!(event.payload, EventPayload::Overview(_)));
        let event = to_event(CoreEvent::PolicyReloaded);
        assert!(matches!(event.payload, EventPayload::ConfigReloaded));
    }

    #[test]
    fn engine_errors_map_to_codes() {
        let response = error_response(7, &RollcallError::StudentNotFound(StudentId::new(3)));
        match response.result {
            rollcall_api::ResponseResult::Err(e) => assert_eq!(e.code, ErrorCode::StudentNotFound),
            _ => panic!("expected an error"),
        }
        let response = error_response(8, &RollcallError::UnknownAlert);
        assert!(matches!(
            response.result,
            rollcall_api::ResponseResult::Err(ErrorInfo { code: ErrorCode::UnknownAlert, .. })
        ));
    }
}
