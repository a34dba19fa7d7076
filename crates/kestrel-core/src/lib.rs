//! Kestrel Core
//!
//! Runtime that connects the Telegram adapters to the model backends, the
//! response cache and the capture engine

mod dispatch;
mod fetch;
mod reply;

pub use dispatch::{Dispatcher, DEFAULT_BOT_NAME};
pub use fetch::PageFetcher;

use anyhow::{Context, Result};
use kestrel_config::Config;
use kestrel_ipc::EventBus;
use kestrel_providers::ProviderRouter;
use kestrel_storage::Journal;
use kestrel_telegram::TelegramAdapter;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tracing::{error, info, warn};

const MAX_INBOUND_CONCURRENCY: usize = 8;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

pub struct KestrelRuntime {
    event_bus: EventBus,
    adapters: Vec<Arc<TelegramAdapter>>,
    dispatcher: Arc<Dispatcher>,
}

impl KestrelRuntime {
    pub fn new(config: Config, journal: Journal) -> Result<Self> {
        let providers =
            ProviderRouter::from_config(&config.backend).context("failed to build model backends")?;
        if providers.get_provider(None).is_none() {
            warn!("No model backend configured; generation requests will fail");
        }

        let engine = kestrel_capture::build_engine(&config.capture);
        let event_bus = EventBus::new();
        let journal = Arc::new(Mutex::new(journal));
        let mut dispatcher = Dispatcher::new(
            &config,
            providers,
            engine,
            journal,
            event_bus.outbound_sender(),
        )?;

        let adapters = Self::build_telegram_adapters(&config, &event_bus);
        for adapter in &adapters {
            dispatcher.register_adapter(Arc::clone(adapter));
        }

        Ok(Self {
            event_bus,
            adapters,
            dispatcher: Arc::new(dispatcher),
        })
    }

    fn build_telegram_adapters(config: &Config, event_bus: &EventBus) -> Vec<Arc<TelegramAdapter>> {
        let Some(telegram) = &config.telegram else {
            return Vec::new();
        };
        let data_dir = config.data_dir();
        let mut seen = HashSet::new();
        let mut adapters = Vec::new();

        for (idx, account) in telegram.accounts.iter().enumerate() {
            let tag = account.account_tag();
            if !seen.insert(tag.clone()) {
                warn!(
                    "Skipping duplicate Telegram account entry for account tag '{}'",
                    tag
                );
                continue;
            }
            info!("Telegram adapter enabled for account #{}", idx + 1);
            let adapter = TelegramAdapter::new(
                account,
                data_dir.clone(),
                telegram.poll_timeout_secs,
                telegram.client_recreate_interval_secs,
            )
            .with_event_bus(event_bus.clone());
            adapters.push(Arc::new(adapter));
        }
        adapters
    }

    pub fn account_tags(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.account_tag()).collect()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn start_telegram_adapters(&self) {
        for adapter in &self.adapters {
            let outbound_rx = self.event_bus.outbound_subscribe();
            let outbound_adapter = Arc::clone(adapter);
            tokio::spawn(async move {
                outbound_adapter.run_outbound_handler(outbound_rx).await;
            });

            let poll_adapter = Arc::clone(adapter);
            tokio::spawn(async move {
                if let Err(e) = poll_adapter.poll().await {
                    error!(
                        account = %poll_adapter.account_tag(),
                        "Telegram adapter failed: {}",
                        e
                    );
                }
            });
        }
    }

    /// Runs until the event bus closes or Ctrl-C arrives.
    pub async fn run(&self) -> Result<()> {
        if self.adapters.is_empty() {
            anyhow::bail!(
                "No Telegram account configured; add [[telegram.accounts]] or set {}",
                kestrel_config::TOKEN_ENV_VAR
            );
        }
        info!("Kestrel runtime starting...");

        let mut inbound_rx = self.event_bus.subscribe();
        self.start_telegram_adapters();

        let inbound_semaphore = Arc::new(Semaphore::new(MAX_INBOUND_CONCURRENCY));
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = inbound_rx.recv() => {
                    match result {
                        Ok(envelope) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let semaphore = Arc::clone(&inbound_semaphore);
                            tokio::spawn(async move {
                                let trace_id = envelope.trace_id.clone();
                                let _permit = match semaphore.acquire_owned().await {
                                    Ok(permit) => permit,
                                    Err(err) => {
                                        error!(
                                            "Inbound worker semaphore closed (trace_id={}): {}",
                                            trace_id, err
                                        );
                                        return;
                                    }
                                };
                                dispatcher.handle(envelope).await;
                            });
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("Event bus closed, stopping message processor");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Event bus lagged by {} messages", n);
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    info!("Kestrel runtime heartbeat");
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_config::{TelegramAccount, TelegramConfig};

    fn account(token: &str) -> TelegramAccount {
        TelegramAccount {
            bot_token: token.to_string(),
            bot_name: None,
            allowed_chats: None,
        }
    }

    fn config_with(accounts: Vec<TelegramAccount>) -> Config {
        let mut config = Config::default();
        config.core.data_dir = Some(std::env::temp_dir().to_string_lossy().into_owned());
        config.capture.enabled = false;
        if !accounts.is_empty() {
            config.telegram = Some(TelegramConfig {
                accounts,
                ..TelegramConfig::default()
            });
        }
        config
    }

    #[tokio::test]
    async fn runtime_without_accounts_refuses_to_start() {
        let runtime = KestrelRuntime::new(
            config_with(Vec::new()),
            Journal::in_memory().expect("journal"),
        )
        .expect("runtime");
        let err = runtime.run().await.expect_err("no accounts");
        assert!(err.to_string().contains("No Telegram account configured"));
    }

    #[test]
    fn duplicate_account_tags_get_one_adapter() {
        let runtime = KestrelRuntime::new(
            config_with(vec![
                account("111:aaa"),
                account("111:bbb"),
                account("222:ccc"),
            ]),
            Journal::in_memory().expect("journal"),
        )
        .expect("runtime");
        assert_eq!(runtime.account_tags(), vec!["111", "222"]);
    }

    #[test]
    fn configured_backend_becomes_default_provider() {
        let mut config = config_with(Vec::new());
        config.backend.providers.push(kestrel_config::ProviderConfig {
            name: "local".to_string(),
            kind: kestrel_config::ProviderKind::Ollama,
            base_url: None,
            model: Some("qwen2.5-coder".to_string()),
            api_key: None,
            command: None,
            args: Vec::new(),
            timeout_secs: None,
            options: Default::default(),
        });

        let runtime =
            KestrelRuntime::new(config, Journal::in_memory().expect("journal")).expect("runtime");
        let provider = runtime
            .dispatcher()
            .providers()
            .get_provider(None)
            .expect("default provider");
        assert_eq!(provider.name(), "local");
        assert_eq!(provider.model(), "qwen2.5-coder");
    }
}
