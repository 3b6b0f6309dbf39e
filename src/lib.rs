//! Mission recorder core.
//!
//! Wires the dispatcher, caches, mission context, storage backend and
//! lifecycle monitor together behind a single [`Recorder`]. Everything
//! host-facing funnels through [`ffi::call_extension`]; everything below
//! that is plain async Rust.

pub mod backend;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod ffi;
pub mod geo;
pub mod lifecycle;
pub mod metrics;
pub mod mission_context;
pub mod parse;
pub mod queue;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use backend::StorageBackend;
use cache::{EntityCache, MarkerCache};
use config::{BackendKind, Config};
use dispatcher::{Dispatcher, HandlerResult, RegisterOptions};
use error::RecorderError;
use lifecycle::{shutdown_channel, Lifecycle, ShutdownHandle, ShutdownSignal};
use mission_context::MissionContext;

/// Initialises the global `tracing` subscriber the way the teacher's
/// `main.rs` does it: `EnvFilter` from the environment, falling back to a
/// crate-scoped default directive.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mission_recorder=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Everything the running extension needs, assembled once at startup.
pub struct Recorder {
    pub dispatcher: Arc<Dispatcher>,
    pub entity_cache: Arc<EntityCache>,
    pub marker_cache: Arc<MarkerCache>,
    pub mission_context: Arc<MissionContext>,
    pub backend: Arc<dyn StorageBackend>,
    pub lifecycle: Arc<Lifecycle>,
    shutdown_handle: ShutdownHandle,
}

async fn build_backend(config: &Config, shutdown: ShutdownSignal, marker_cache: Arc<MarkerCache>) -> anyhow::Result<Arc<dyn StorageBackend>> {
    let backend: Arc<dyn StorageBackend> = match config.backend {
        BackendKind::Relational => {
            let relational = config
                .relational
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("backend = relational requires a [relational] section"))?;
            let pool = sqlx::postgres::PgPoolOptions::new().connect(&relational.dsn).await?;
            Arc::new(backend::relational::RelationalBackend::new(
                pool,
                config.relational_drain_interval(),
                shutdown,
                marker_cache,
            ))
        }
        BackendKind::Streaming => {
            let streaming = config
                .streaming
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("backend = streaming requires a [streaming] section"))?;
            Arc::new(backend::streaming::StreamingBackend::new(
                &streaming.url,
                &streaming.secret,
                config.streaming_ack_timeout(),
                shutdown,
            )?)
        }
        BackendKind::Memory => {
            let memory = config
                .memory
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("backend = memory requires a [memory] section"))?;
            Arc::new(backend::memory::MemoryBackend::new(
                memory.output_dir.clone(),
                None,
                config.extension_version.clone(),
                config.extension_build.clone(),
                config.tag.clone(),
            ))
        }
    };
    backend.init().await?;
    Ok(backend)
}

impl Recorder {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let (shutdown_handle, shutdown) = shutdown_channel();
        let entity_cache = Arc::new(EntityCache::new());
        let marker_cache = Arc::new(MarkerCache::new());
        let mission_context = Arc::new(MissionContext::new());

        let backend = build_backend(config, shutdown.clone(), marker_cache.clone()).await?;

        let meter = opentelemetry::global::meter("mission_recorder");
        let dispatcher = Arc::new(Dispatcher::new(meter)?);

        let lifecycle = Arc::new(Lifecycle::new(
            mission_context.clone(),
            entity_cache.clone(),
            marker_cache.clone(),
            backend.clone(),
            config.status_file.clone(),
            shutdown.clone(),
        ));

        let recorder = Self {
            dispatcher,
            entity_cache,
            marker_cache,
            mission_context,
            backend,
            lifecycle,
            shutdown_handle,
        };
        recorder.register_handlers().await?;
        Ok(recorder)
    }

    /// Fires the shutdown signal every long-running task polls, then closes
    /// the backend (drainer/writer/reader tasks stop via the signal; the
    /// backend's own `close` tears down its connection).
    pub async fn shutdown(&self) -> Result<(), RecorderError> {
        self.shutdown_handle.fire();
        self.backend.close().await
    }

    /// Registers every command from spec.md §4.4 on the dispatcher. Entity
    /// mutations are direct (cheap, cache-only); record-* commands that feed
    /// a backend are buffered so the host's calling thread never blocks on
    /// backend I/O.
    async fn register_handlers(&self) -> Result<(), RecorderError> {
        let d = &self.dispatcher;

        {
            let mission_context = self.mission_context.clone();
            let marker_cache = self.marker_cache.clone();
            let backend = self.backend.clone();
            d.register(
                ":NEW:MISSION:",
                Arc::new(move |args| {
                    let mission_context = mission_context.clone();
                    let marker_cache = marker_cache.clone();
                    let backend = backend.clone();
                    Box::pin(async move {
                        let (world, mission) = parse::parse_new_mission(&args)?;
                        let started = backend.start_mission(mission, world).await?;
                        mission_context.start(started).await;
                        marker_cache.reset().await;
                        Ok("OK".to_string())
                    })
                }),
                RegisterOptions::new().logged(),
            )
            .await?;
        }

        {
            let mission_context = self.mission_context.clone();
            let entity_cache = self.entity_cache.clone();
            let backend = self.backend.clone();
            d.register(
                ":END:MISSION:",
                Arc::new(move |_args| {
                    let mission_context = mission_context.clone();
                    let entity_cache = entity_cache.clone();
                    let backend = backend.clone();
                    Box::pin(async move {
                        backend.end_mission().await?;
                        entity_cache.reset().await;
                        mission_context.end().await;
                        Ok("OK".to_string())
                    })
                }),
                RegisterOptions::new().logged(),
            )
            .await?;
        }

        {
            let mission_context = self.mission_context.clone();
            let entity_cache = self.entity_cache.clone();
            let backend = self.backend.clone();
            d.register(
                ":NEW:SOLDIER:",
                Arc::new(move |args| {
                    let mission_context = mission_context.clone();
                    let entity_cache = entity_cache.clone();
                    let backend = backend.clone();
                    Box::pin(async move {
                        let mission_id = mission_context.mission_id().await;
                        let soldier = parse::parse_new_soldier(mission_id, &args)?;
                        entity_cache.add_soldier(soldier.clone()).await;
                        backend.add_soldier(soldier).await?;
                        Ok("OK".to_string())
                    })
                }),
                RegisterOptions::new(),
            )
            .await?;
        }

        {
            let mission_context = self.mission_context.clone();
            let entity_cache = self.entity_cache.clone();
            let backend = self.backend.clone();
            d.register(
                ":NEW:VEHICLE:",
                Arc::new(move |args| {
                    let mission_context = mission_context.clone();
                    let entity_cache = entity_cache.clone();
                    let backend = backend.clone();
                    Box::pin(async move {
                        let mission_id = mission_context.mission_id().await;
                        let vehicle = parse::parse_new_vehicle(mission_id, &args)?;
                        entity_cache.add_vehicle(vehicle.clone()).await;
                        backend.add_vehicle(vehicle).await?;
                        Ok("OK".to_string())
                    })
                }),
                RegisterOptions::new(),
            )
            .await?;
        }

        {
            let mission_context = self.mission_context.clone();
            let entity_cache = self.entity_cache.clone();
            let backend = self.backend.clone();
            d.register(
                ":NEW:SOLDIER:STATE:",
                Arc::new(move |args| {
                    let mission_context = mission_context.clone();
                    let entity_cache = entity_cache.clone();
                    let backend = backend.clone();
                    Box::pin(async move {
                        let mission_id = mission_context.mission_id().await;
                        let state = parse::parse_new_soldier_state(mission_id, &args, &entity_cache).await?;
                        backend.record_soldier_state(state).await?;
                        Ok("queued".to_string())
                    })
                }),
                RegisterOptions::new().buffered(4096),
            )
            .await?;
        }

        {
            let mission_context = self.mission_context.clone();
            let backend = self.backend.clone();
            d.register(
                ":NEW:VEHICLE:STATE:",
                Arc::new(move |args| {
                    let mission_context = mission_context.clone();
                    let backend = backend.clone();
                    Box::pin(async move {
                        let mission_id = mission_context.mission_id().await;
                        let state = parse::parse_new_vehicle_state(mission_id, &args)?;
                        backend.record_vehicle_state(state).await?;
                        Ok("queued".to_string())
                    })
                }),
                RegisterOptions::new().buffered(4096),
            )
            .await?;
        }

        {
            let mission_context = self.mission_context.clone();
            let backend = self.backend.clone();
            d.register(
                ":FIRED:",
                Arc::new(move |args| {
                    let mission_context = mission_context.clone();
                    let backend = backend.clone();
                    Box::pin(async move {
                        let mission_id = mission_context.mission_id().await;
                        let event = parse::parse_fired(mission_id, &args)?;
                        backend.record_fired_event(event).await?;
                        Ok("queued".to_string())
                    })
                }),
                RegisterOptions::new().buffered(4096),
            )
            .await?;
        }

        {
            let mission_context = self.mission_context.clone();
            let entity_cache = self.entity_cache.clone();
            let backend = self.backend.clone();
            d.register(
                ":PROJECTILE:",
                Arc::new(move |args| {
                    let mission_context = mission_context.clone();
                    let entity_cache = entity_cache.clone();
                    let backend = backend.clone();
                    Box::pin(async move {
                        let mission_id = mission_context.mission_id().await;
                        let raw = args.first().map(String::as_str).unwrap_or_default();
                        let event = parse::parse_projectile(mission_id, raw, &entity_cache).await?;
                        backend.record_projectile_event(event).await?;
                        Ok("queued".to_string())
                    })
                }),
                RegisterOptions::new().buffered(2048),
            )
            .await?;
        }

        {
            let mission_context = self.mission_context.clone();
            let backend = self.backend.clone();
            d.register(
                ":EVENT:",
                Arc::new(move |args| {
                    let mission_context = mission_context.clone();
                    let backend = backend.clone();
                    Box::pin(async move {
                        let mission_id = mission_context.mission_id().await;
                        let event = parse::parse_general_event(mission_id, &args)?;
                        backend.record_general_event(event).await?;
                        Ok("queued".to_string())
                    })
                }),
                RegisterOptions::new().buffered(1024),
            )
            .await?;
        }

        for (command, is_kill) in [(":HIT:", false), (":KILL:", true)] {
            let mission_context = self.mission_context.clone();
            let entity_cache = self.entity_cache.clone();
            let backend = self.backend.clone();
            d.register(
                command,
                Arc::new(move |args| {
                    let mission_context = mission_context.clone();
                    let entity_cache = entity_cache.clone();
                    let backend = backend.clone();
                    Box::pin(async move {
                        let mission_id = mission_context.mission_id().await;
                        let event = parse::parse_hit_or_kill(mission_id, command, &args, &entity_cache).await?;
                        if is_kill {
                            backend.record_kill_event(event).await?;
                        } else {
                            backend.record_hit_event(event).await?;
                        }
                        Ok("queued".to_string())
                    })
                }),
                RegisterOptions::new().buffered(1024),
            )
            .await?;
        }

        {
            let mission_context = self.mission_context.clone();
            let backend = self.backend.clone();
            d.register(
                ":CHAT:",
                Arc::new(move |args| {
                    let mission_context = mission_context.clone();
                    let backend = backend.clone();
                    Box::pin(async move {
                        let mission_id = mission_context.mission_id().await;
                        let event = parse::parse_chat(mission_id, &args)?;
                        backend.record_chat_event(event).await?;
                        Ok("queued".to_string())
                    })
                }),
                RegisterOptions::new().buffered(1024),
            )
            .await?;
        }

        {
            let mission_context = self.mission_context.clone();
            let backend = self.backend.clone();
            d.register(
                ":RADIO:",
                Arc::new(move |args| {
                    let mission_context = mission_context.clone();
                    let backend = backend.clone();
                    Box::pin(async move {
                        let mission_id = mission_context.mission_id().await;
                        let event = parse::parse_radio(mission_id, &args)?;
                        backend.record_radio_event(event).await?;
                        Ok("queued".to_string())
                    })
                }),
                RegisterOptions::new().buffered(1024),
            )
            .await?;
        }

        {
            let mission_context = self.mission_context.clone();
            let backend = self.backend.clone();
            d.register(
                ":FPS:",
                Arc::new(move |args| {
                    let mission_context = mission_context.clone();
                    let backend = backend.clone();
                    Box::pin(async move {
                        let mission_id = mission_context.mission_id().await;
                        let event = parse::parse_fps(mission_id, &args)?;
                        backend.record_telemetry_event(event).await?;
                        Ok("queued".to_string())
                    })
                }),
                RegisterOptions::new().buffered(256),
            )
            .await?;
        }

        {
            let mission_context = self.mission_context.clone();
            let backend = self.backend.clone();
            d.register(
                ":TIME:",
                Arc::new(move |args| {
                    let mission_context = mission_context.clone();
                    let backend = backend.clone();
                    Box::pin(async move {
                        let mission_id = mission_context.mission_id().await;
                        let state = parse::parse_time_state(mission_id, &args)?;
                        backend.record_time_state(state).await?;
                        Ok("queued".to_string())
                    })
                }),
                RegisterOptions::new().buffered(256),
            )
            .await?;
        }

        {
            let mission_context = self.mission_context.clone();
            let backend = self.backend.clone();
            d.register(
                ":ACE3:DEATH:",
                Arc::new(move |args| {
                    let mission_context = mission_context.clone();
                    let backend = backend.clone();
                    Box::pin(async move {
                        let mission_id = mission_context.mission_id().await;
                        let event = parse::parse_ace3_death(mission_id, &args)?;
                        backend.record_ace3_death_event(event).await?;
                        Ok("queued".to_string())
                    })
                }),
                RegisterOptions::new().buffered(256),
            )
            .await?;
        }

        {
            let mission_context = self.mission_context.clone();
            let backend = self.backend.clone();
            d.register(
                ":ACE3:UNCONSCIOUS:",
                Arc::new(move |args| {
                    let mission_context = mission_context.clone();
                    let backend = backend.clone();
                    Box::pin(async move {
                        let mission_id = mission_context.mission_id().await;
                        let event = parse::parse_ace3_unconscious(mission_id, &args)?;
                        backend.record_ace3_unconscious_event(event).await?;
                        Ok("queued".to_string())
                    })
                }),
                RegisterOptions::new().buffered(256),
            )
            .await?;
        }

        {
            let mission_context = self.mission_context.clone();
            let marker_cache = self.marker_cache.clone();
            let backend = self.backend.clone();
            d.register(
                ":NEW:MARKER:",
                Arc::new(move |args| {
                    let mission_context = mission_context.clone();
                    let marker_cache = marker_cache.clone();
                    let backend = backend.clone();
                    Box::pin(async move {
                        let mission_id = mission_context.mission_id().await;
                        let marker = parse::parse_new_marker(mission_id, &args)?;
                        let marker_name = marker.marker_name.clone();
                        let marker_id = backend.add_marker(marker).await?;
                        marker_cache.set(marker_name, marker_id).await;
                        Ok(marker_id.to_string())
                    })
                }),
                RegisterOptions::new().logged(),
            )
            .await?;
        }

        {
            let mission_context = self.mission_context.clone();
            let marker_cache = self.marker_cache.clone();
            let backend = self.backend.clone();
            d.register(
                ":NEW:MARKER:STATE:",
                Arc::new(move |args| {
                    let mission_context = mission_context.clone();
                    let marker_cache = marker_cache.clone();
                    let backend = backend.clone();
                    Box::pin(async move {
                        let mission_id = mission_context.mission_id().await;
                        let name = args.first().cloned().unwrap_or_default();
                        let Some(marker_id) = marker_cache.get(&name).await else {
                            return Err(RecorderError::CacheMiss { command: ":NEW:MARKER:STATE:", cache: "marker", id: 0 });
                        };
                        let state = parse::parse_new_marker_state(mission_id, marker_id, &args)?;
                        backend.record_marker_state(state).await?;
                        Ok("queued".to_string())
                    })
                }),
                RegisterOptions::new().buffered(1024),
            )
            .await?;
        }

        {
            let mission_context = self.mission_context.clone();
            let marker_cache = self.marker_cache.clone();
            let backend = self.backend.clone();
            d.register(
                ":DELETE:MARKER:",
                Arc::new(move |args| {
                    let mission_context = mission_context.clone();
                    let marker_cache = marker_cache.clone();
                    let backend = backend.clone();
                    Box::pin(async move {
                        let mission_id = mission_context.mission_id().await;
                        let name = args.first().cloned().unwrap_or_default();
                        let frame = args.get(1).and_then(|s| s.parse::<i64>().ok()).unwrap_or(0);
                        let Some(marker_id) = marker_cache.delete(&name).await else {
                            return Err(RecorderError::CacheMiss { command: ":DELETE:MARKER:", cache: "marker", id: 0 });
                        };
                        let state = parse::synthesize_marker_deletion(mission_id, marker_id, frame);
                        backend.delete_marker(marker_id, frame).await?;
                        backend.record_marker_state(state).await?;
                        Ok("OK".to_string())
                    })
                }),
                RegisterOptions::new().logged(),
            )
            .await?;
        }

        Ok(())
    }

    /// Called by the host on every dispatched command.
    pub async fn dispatch(&self, command: &str, args: Vec<String>) -> HandlerResult {
        self.dispatcher.dispatch(command, args).await
    }
}
