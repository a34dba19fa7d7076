use crate::fetch::PageFetcher;
use crate::reply;
use anyhow::{anyhow, Result};
use kestrel_capture::{
    CaptureEngine, CaptureFilter, CaptureLimiter, CaptureReport, CaptureRequest,
};
use kestrel_config::{CaptureConfig, Config};
use kestrel_ipc::{Envelope, MessageKind, OutboundMessage};
use kestrel_policy::PolicyEngine;
use kestrel_providers::{GenerateRequest, ProviderError, ProviderRouter};
use kestrel_router::{detect_intent, extract_urls, Intent, PromptTemplates};
use kestrel_storage::{cache_key, ExchangeRecord, Journal, KnowledgeBase, ResponseCache};
use kestrel_telegram::{TelegramAdapter, MAX_DOWNLOAD_BYTES};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

pub const DEFAULT_BOT_NAME: &str = "Kestrel";

const KNOWLEDGE_FILES: usize = 5;
const KNOWLEDGE_CHARS_PER_FILE: usize = 500;
const HISTORY_LIMIT: usize = 10;
const DOCUMENT_TIMEOUT: Duration = Duration::from_secs(300);
const TYPING_INTERVAL: Duration = Duration::from_secs(4);

/// Where the replies to one inbound message go.
#[derive(Debug, Clone)]
struct ReplyTarget {
    channel: String,
    account_tag: Option<String>,
    chat_id: i64,
    reply_to: Option<i64>,
}

struct TypingHeartbeat {
    stop: Arc<AtomicBool>,
}

impl Drop for TypingHeartbeat {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

struct Generated {
    text: String,
    model: String,
    cached: bool,
}

/// Handles one inbound envelope at a time; shared across worker tasks.
pub struct Dispatcher {
    providers: ProviderRouter,
    cache: Option<ResponseCache>,
    cache_ttl_secs: u64,
    knowledge: KnowledgeBase,
    prompts: PromptTemplates,
    account_prompts: HashMap<String, PromptTemplates>,
    policy: PolicyEngine,
    fetcher: PageFetcher,
    capture_config: CaptureConfig,
    capture_filter: CaptureFilter,
    limiter: CaptureLimiter,
    engine: Arc<dyn CaptureEngine>,
    journal: Arc<Mutex<Journal>>,
    adapters: HashMap<String, Arc<TelegramAdapter>>,
    outbound: broadcast::Sender<OutboundMessage>,
}

fn load_persona(config: &Config) -> Option<String> {
    let path = config.core.persona_file.as_deref()?;
    let path = kestrel_config::expand_user_path(path);
    match std::fs::read_to_string(&path) {
        Ok(content) => {
            info!("Loaded persona from {}", path.display());
            Some(content)
        }
        Err(e) => {
            warn!("Failed to load persona from {}: {}", path.display(), e);
            None
        }
    }
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        providers: ProviderRouter,
        engine: Arc<dyn CaptureEngine>,
        journal: Arc<Mutex<Journal>>,
        outbound: broadcast::Sender<OutboundMessage>,
    ) -> Result<Self> {
        let persona = load_persona(config);
        let bot_name = config
            .core
            .bot_name
            .clone()
            .unwrap_or_else(|| DEFAULT_BOT_NAME.to_string());

        let mut account_prompts = HashMap::new();
        if let Some(telegram) = &config.telegram {
            for account in &telegram.accounts {
                if let Some(name) = account.bot_name.as_deref().filter(|n| !n.trim().is_empty()) {
                    account_prompts.insert(
                        account.account_tag(),
                        PromptTemplates::new(name.trim(), persona.clone()),
                    );
                }
            }
        }

        let cache = config.cache.enabled.then(|| {
            ResponseCache::new(
                Duration::from_secs(config.cache.ttl_secs),
                config.cache.max_entries,
            )
        });

        Ok(Self {
            providers,
            cache,
            cache_ttl_secs: config.cache.ttl_secs,
            knowledge: KnowledgeBase::new(config.knowledge_base_dir()),
            prompts: PromptTemplates::new(bot_name, persona),
            account_prompts,
            policy: PolicyEngine::new(config.policy.as_ref()),
            fetcher: PageFetcher::new(&config.fetch)?,
            capture_config: config.capture.clone(),
            capture_filter: CaptureFilter::from_config(&config.capture),
            limiter: CaptureLimiter::new(config.capture.max_concurrent_jobs),
            engine,
            journal,
            adapters: HashMap::new(),
            outbound,
        })
    }

    /// Registers the adapter used to download files sent to that bot.
    pub fn register_adapter(&mut self, adapter: Arc<TelegramAdapter>) {
        self.adapters
            .insert(adapter.account_tag().to_string(), adapter);
    }

    pub fn providers(&self) -> &ProviderRouter {
        &self.providers
    }

    fn prompts_for(&self, target: &ReplyTarget) -> &PromptTemplates {
        target
            .account_tag
            .as_deref()
            .and_then(|tag| self.account_prompts.get(tag))
            .unwrap_or(&self.prompts)
    }

    fn send(&self, target: &ReplyTarget, text: &str) {
        let message = OutboundMessage::text(
            &target.channel,
            target.account_tag.clone(),
            target.chat_id,
            text,
        )
        .with_reply_to(target.reply_to);
        if self.outbound.send(message).is_err() {
            debug!(chat_id = target.chat_id, "No outbound subscriber for reply");
        }
    }

    fn start_typing(&self, target: &ReplyTarget) -> Option<TypingHeartbeat> {
        if target.channel != "telegram" {
            return None;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let outbound = self.outbound.clone();
        let channel = target.channel.clone();
        let account_tag = target.account_tag.clone();
        let chat_id = target.chat_id;

        tokio::spawn(async move {
            while !stop_flag.load(Ordering::Relaxed) {
                let _ = outbound.send(OutboundMessage::action(
                    &channel,
                    account_tag.clone(),
                    chat_id,
                    "typing",
                ));
                tokio::time::sleep(TYPING_INTERVAL).await;
            }
        });

        Some(TypingHeartbeat { stop })
    }

    pub async fn handle(&self, envelope: Envelope) {
        let Some(chat_id) = envelope.chat_id else {
            debug!(trace_id = %envelope.trace_id, "Dropping envelope without chat id");
            return;
        };
        let target = ReplyTarget {
            channel: envelope.channel.clone(),
            account_tag: envelope.account_tag(),
            chat_id,
            reply_to: envelope.message_id,
        };

        let chat_key = chat_id.to_string();
        if !self.policy.is_allowed(&chat_key) {
            warn!("Blocked message by policy from {}", chat_key);
            self.send(&target, "Access denied by policy.");
            return;
        }

        let sender = envelope.kind.sender();
        let rate_key = format!(
            "{}:{}",
            target.account_tag.as_deref().unwrap_or("-"),
            if sender.is_empty() { chat_key.as_str() } else { sender }
        );
        if !self.policy.record_and_check(&rate_key) {
            warn!("Rate limit exceeded for {}", rate_key);
            self.send(&target, "Rate limit exceeded. Please retry shortly.");
            return;
        }

        let result = match &envelope.kind {
            MessageKind::Command { name, args, .. } => {
                self.handle_command(&target, name, args).await
            }
            MessageKind::Message { text, .. } => self.handle_text(&target, text).await,
            MessageKind::Document {
                file_id,
                file_name,
                caption,
                file_size,
                ..
            } => {
                self.handle_document(
                    &target,
                    file_id,
                    file_name.as_deref(),
                    caption.as_deref(),
                    *file_size,
                )
                .await
            }
        };

        if let Err(err) = result {
            error!(
                trace_id = %envelope.trace_id,
                chat_id,
                "Error handling message: {:#}",
                err
            );
            self.send(&target, &reply::error_text(&err));
        }
    }

    async fn handle_command(&self, target: &ReplyTarget, name: &str, args: &[String]) -> Result<()> {
        info!(chat_id = target.chat_id, command = %name, "Command");
        let joined = args.join(" ");

        match name {
            "start" => self.send(target, &self.prompts_for(target).welcome()),
            "help" => self.send(target, &self.prompts_for(target).help()),
            "analyze" | "analyse" => match extract_urls(&joined).into_iter().next() {
                Some(url) => {
                    let request = joined.replacen(&url, "", 1);
                    let request = if request.trim().is_empty() {
                        "Explain how this page works."
                    } else {
                        request.trim()
                    };
                    self.analyze(target, &url, request).await?;
                }
                None => self.send(target, "Usage: /analyze <url> [what you want to know]"),
            },
            "capture" => match extract_urls(&joined).into_iter().next() {
                Some(url) => self.capture(target, &url).await?,
                None => self.send(target, "Usage: /capture <url>"),
            },
            "cache" => {
                if args.first().is_some_and(|a| a.eq_ignore_ascii_case("clear")) {
                    let removed = self.cache.as_ref().map(|c| c.purge()).unwrap_or(0);
                    info!(removed, "Response cache cleared");
                    self.send(target, &format!("Cleared {} cached responses.", removed));
                } else {
                    let stats = self.cache.as_ref().map(|c| c.stats());
                    self.send(target, &reply::cache_text(stats, self.cache_ttl_secs));
                }
            }
            "kb" => {
                let knowledge = self.knowledge.clone();
                let files = tokio::task::spawn_blocking(move || knowledge.list())
                    .await
                    .map_err(|e| anyhow!("knowledge listing task failed: {}", e))??;
                self.send(target, &reply::knowledge_text(&files));
            }
            "stats" => {
                let stats = self.journal.lock().await.stats()?;
                self.send(
                    target,
                    &reply::stats_text(&stats, self.limiter.running(), self.limiter.capacity()),
                );
            }
            "history" => {
                let records = self.journal.lock().await.recent_captures(HISTORY_LIMIT)?;
                self.send(target, &reply::history_text(&records));
            }
            other => self.send(
                target,
                &format!("Unknown command /{}. Send /help for the list.", other),
            ),
        }
        Ok(())
    }

    async fn handle_text(&self, target: &ReplyTarget, text: &str) -> Result<()> {
        let intent = detect_intent(text);
        info!(chat_id = target.chat_id, intent = intent.label(), "Routing message");

        match intent {
            Intent::Introduction => {
                let model = self
                    .providers
                    .get_provider(None)
                    .map(|p| p.model())
                    .unwrap_or("unknown");
                self.send(target, &self.prompts_for(target).introduction(model));
            }
            Intent::WebsiteAnalysis { url: None } => self.send(
                target,
                "Please send the URL of the website you want me to analyze.",
            ),
            Intent::WebsiteAnalysis { url: Some(url) } => self.analyze(target, &url, text).await?,
            Intent::Capture { url } => self.capture(target, &url).await?,
            Intent::General => self.general(target, text).await?,
        }
        Ok(())
    }

    async fn analyze(&self, target: &ReplyTarget, url: &str, request: &str) -> Result<()> {
        let _typing = self.start_typing(target);
        let started = Instant::now();

        let page = self.fetcher.fetch(url).await?;
        let (system, prompt) = self.prompts_for(target).analysis(url, &page, request);
        let intent = Intent::WebsiteAnalysis {
            url: Some(url.to_string()),
        };
        let generated = self
            .generate(target, intent.label(), &system, &prompt, intent.generation_timeout())
            .await?;

        self.send_answer(target, &generated, started, None);
        Ok(())
    }

    async fn general(&self, target: &ReplyTarget, text: &str) -> Result<()> {
        let _typing = self.start_typing(target);
        let started = Instant::now();

        let knowledge = self.knowledge.clone();
        let excerpt = tokio::task::spawn_blocking(move || {
            knowledge.load(KNOWLEDGE_FILES, KNOWLEDGE_CHARS_PER_FILE)
        })
        .await
        .unwrap_or_default();

        let (system, prompt) = self.prompts_for(target).general(text, &excerpt);
        let intent = Intent::General;
        let generated = self
            .generate(target, intent.label(), &system, &prompt, intent.generation_timeout())
            .await?;

        self.send_answer(target, &generated, started, None);
        Ok(())
    }

    async fn capture(&self, target: &ReplyTarget, url: &str) -> Result<()> {
        let request = CaptureRequest::from_config(url, &self.capture_config);

        let outcome = if self.engine.is_available() {
            let permit = match self.limiter.try_acquire() {
                Some(permit) => permit,
                None => {
                    info!(url = %url, running = self.limiter.running(), "Capture queued");
                    self.send(
                        target,
                        &format!(
                            "All {} browser slots are busy. Your capture of {} is queued.",
                            self.limiter.capacity(),
                            url
                        ),
                    );
                    self.limiter.acquire().await?
                }
            };
            let _typing = self.start_typing(target);
            let outcome = self.engine.capture(&request).await;
            drop(permit);
            outcome?
        } else {
            self.engine.capture(&request).await?
        };

        let _typing = self.start_typing(target);
        let started = Instant::now();
        let report = CaptureReport::from_outcome(&outcome, &self.capture_filter);
        let rendered = report.render(self.capture_config.max_body_chars);

        {
            let journal = self.journal.lock().await;
            if let Err(e) = journal.record_capture(
                url,
                report.final_url.as_deref(),
                report.total_entries,
                report.entries.len(),
                report.elapsed.as_millis() as u64,
            ) {
                warn!("Failed to record capture: {}", e);
            }
        }

        if report.is_empty() {
            self.send(
                target,
                &format!("{}\n\nNo API requests were observed.", rendered),
            );
            return Ok(());
        }

        let (system, prompt) = self.prompts_for(target).capture_summary(url, &rendered);
        let intent = Intent::Capture {
            url: url.to_string(),
        };
        match self
            .generate(target, intent.label(), &system, &prompt, intent.generation_timeout())
            .await
        {
            Ok(generated) => {
                let header = format!(
                    "Captured {} of {} requests from {}",
                    report.entries.len(),
                    report.total_entries,
                    url
                );
                self.send_answer(target, &generated, started, Some(&header));
            }
            Err(err) => {
                warn!(url = %url, "Capture summary failed, sending raw report: {:#}", err);
                self.send(
                    target,
                    &format!(
                        "Summary unavailable ({}). Raw capture:\n\n{}",
                        reply::error_text(&err),
                        rendered
                    ),
                );
            }
        }
        Ok(())
    }

    async fn handle_document(
        &self,
        target: &ReplyTarget,
        file_id: &str,
        file_name: Option<&str>,
        caption: Option<&str>,
        file_size: Option<i64>,
    ) -> Result<()> {
        let name = file_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or("document.txt");

        if file_size.is_some_and(|size| size as u64 > MAX_DOWNLOAD_BYTES as u64) {
            self.send(
                target,
                &format!(
                    "{} is too large; the limit is {} MB.",
                    name,
                    MAX_DOWNLOAD_BYTES / (1024 * 1024)
                ),
            );
            return Ok(());
        }

        let adapter = target
            .account_tag
            .as_deref()
            .and_then(|tag| self.adapters.get(tag))
            .ok_or_else(|| anyhow!("no adapter can download files for this chat"))?;

        let _typing = self.start_typing(target);
        let started = Instant::now();
        let bytes = adapter.download_file(file_id, MAX_DOWNLOAD_BYTES).await?;

        let mut stored = None;
        if KnowledgeBase::is_supported(name) {
            let knowledge = self.knowledge.clone();
            let owned_name = name.to_string();
            let owned_bytes = bytes.clone();
            match tokio::task::spawn_blocking(move || knowledge.save(&owned_name, &owned_bytes))
                .await
            {
                Ok(Ok(path)) => stored = Some(path),
                Ok(Err(e)) => warn!("Could not store {} in the knowledge base: {}", name, e),
                Err(e) => warn!("Knowledge store task failed: {}", e),
            }
        }

        let content = String::from_utf8_lossy(&bytes);
        let (system, prompt) = self
            .prompts_for(target)
            .document(name, caption.unwrap_or(""), &content);
        let generated = self
            .generate(target, "document", &system, &prompt, DOCUMENT_TIMEOUT)
            .await?;

        let header = stored
            .as_ref()
            .map(|_| format!("Saved `{}` to the knowledge base.", name));
        self.send_answer(target, &generated, started, header.as_deref());
        Ok(())
    }

    /// One model call through the response cache.
    async fn generate(
        &self,
        target: &ReplyTarget,
        intent: &str,
        system: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<Generated> {
        let provider = self.providers.get_provider(None).ok_or_else(|| {
            ProviderError::UnknownProvider(self.providers.default_name().to_string())
        })?;
        let key = cache_key(provider.name(), provider.model(), system, prompt);
        let started = Instant::now();

        if let Some(text) = self.cache.as_ref().and_then(|c| c.get(&key)) {
            debug!(intent, provider = provider.name(), "Response cache hit");
            let generated = Generated {
                text,
                model: provider.model().to_string(),
                cached: true,
            };
            self.record_exchange(target, intent, prompt, &generated, started.elapsed())
                .await;
            return Ok(generated);
        }

        let request = GenerateRequest::new(system, prompt).with_timeout(timeout);
        let response = provider
            .generate(&request, Some(self.providers.retry_policy()))
            .await?;
        info!(
            intent,
            provider = provider.name(),
            model = %response.model,
            elapsed_ms = response.elapsed.as_millis() as u64,
            chars = response.text.chars().count(),
            "Generation finished"
        );

        if let Some(cache) = &self.cache {
            if !response.text.trim().is_empty() {
                cache.insert(key, response.text.clone());
            }
        }

        let generated = Generated {
            text: response.text,
            model: response.model,
            cached: false,
        };
        self.record_exchange(target, intent, prompt, &generated, response.elapsed)
            .await;
        Ok(generated)
    }

    async fn record_exchange(
        &self,
        target: &ReplyTarget,
        intent: &str,
        prompt: &str,
        generated: &Generated,
        elapsed: Duration,
    ) {
        let record = ExchangeRecord {
            channel: target.channel.clone(),
            chat_id: Some(target.chat_id),
            intent: intent.to_string(),
            model: generated.model.clone(),
            prompt_chars: prompt.chars().count(),
            response_chars: generated.text.chars().count(),
            elapsed_ms: elapsed.as_millis() as u64,
            cached: generated.cached,
        };
        if let Err(e) = self.journal.lock().await.record_exchange(&record) {
            warn!("Failed to record exchange: {}", e);
        }
    }

    fn send_answer(
        &self,
        target: &ReplyTarget,
        generated: &Generated,
        started: Instant,
        header: Option<&str>,
    ) {
        let body = if generated.text.trim().is_empty() {
            "The model returned an empty response."
        } else {
            generated.text.as_str()
        };
        let mut text = reply::with_footer(body, started.elapsed(), &generated.model, generated.cached);
        if let Some(header) = header {
            text = format!("{}\n\n{}", header, text);
        }
        self.send(target, &text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use httpmock::prelude::*;
    use kestrel_capture::{CaptureOutcome, NetworkEntry, StepOutcome};
    use kestrel_config::{PolicyConfig, TelegramAccount};
    use kestrel_providers::{GenerateResponse, Provider, RetryPolicy};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[derive(Clone, Copy)]
    enum Mode {
        Echo,
        Timeout,
        Fail,
    }

    struct Scripted {
        mode: Mode,
        calls: Arc<AtomicUsize>,
        prompts: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Provider for Scripted {
        fn name(&self) -> &str {
            "local"
        }

        fn model(&self) -> &str {
            "test-model"
        }

        async fn generate(
            &self,
            request: &GenerateRequest,
            _retry_policy: Option<&RetryPolicy>,
        ) -> Result<GenerateResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts
                .lock()
                .expect("prompts")
                .push(request.prompt.clone());
            match self.mode {
                Mode::Echo => Ok(GenerateResponse {
                    text: format!("answer #{}", self.calls.load(Ordering::SeqCst)),
                    model: "test-model".to_string(),
                    elapsed: Duration::from_millis(5),
                }),
                Mode::Timeout => Err(ProviderError::Timeout {
                    provider: "local".to_string(),
                    secs: 1,
                }
                .into()),
                Mode::Fail => Err(anyhow!("backend exploded")),
            }
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    struct FixedEngine;

    #[async_trait]
    impl CaptureEngine for FixedEngine {
        async fn capture(&self, request: &CaptureRequest) -> Result<CaptureOutcome> {
            Ok(CaptureOutcome {
                url: request.url.clone(),
                final_url: Some(format!("{}/cart", request.url)),
                steps: vec![StepOutcome {
                    name: "add".to_string(),
                    clicked: Some("button.add".to_string()),
                }],
                entries: vec![
                    NetworkEntry {
                        method: "GET".to_string(),
                        url: format!("{}/logo.png", request.url),
                        resource_type: Some("image".to_string()),
                        status: Some(200),
                        mime_type: Some("image/png".to_string()),
                        post_data: None,
                    },
                    NetworkEntry {
                        method: "POST".to_string(),
                        url: format!("{}/api/cart", request.url),
                        resource_type: Some("fetch".to_string()),
                        status: Some(201),
                        mime_type: Some("application/json".to_string()),
                        post_data: Some("{\"sku\":7}".to_string()),
                    },
                ],
                warnings: Vec::new(),
                elapsed: Duration::from_millis(2500),
            })
        }

        fn is_available(&self) -> bool {
            true
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        outbound: broadcast::Receiver<OutboundMessage>,
        calls: Arc<AtomicUsize>,
        prompts: Arc<std::sync::Mutex<Vec<String>>>,
        kb_dir: PathBuf,
    }

    fn temp_dir(name: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("kestrel-core-{}-{}", name, ts))
    }

    fn harness(name: &str, mode: Mode, configure: impl FnOnce(&mut Config)) -> Harness {
        let kb_dir = temp_dir(name);
        let mut config = Config::default();
        config.core.knowledge_base_dir = Some(kb_dir.to_string_lossy().into_owned());
        configure(&mut config);

        let calls = Arc::new(AtomicUsize::new(0));
        let prompts = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut providers = ProviderRouter::new();
        providers.add_provider(Box::new(Scripted {
            mode,
            calls: Arc::clone(&calls),
            prompts: Arc::clone(&prompts),
        }));

        let (tx, rx) = broadcast::channel(64);
        let journal = Arc::new(Mutex::new(Journal::in_memory().expect("journal")));
        let dispatcher =
            Dispatcher::new(&config, providers, Arc::new(FixedEngine), journal, tx).expect("dispatcher");

        Harness {
            dispatcher,
            outbound: rx,
            calls,
            prompts,
            kb_dir,
        }
    }

    fn text_envelope(chat_id: i64, text: &str) -> Envelope {
        Envelope::new("telegram", MessageKind::from_text("42", text))
            .with_chat_id(chat_id)
            .with_message_id(7)
            .with_payload(serde_json::json!({ "account_tag": "123456" }))
    }

    /// Replies sent so far, typing actions skipped.
    fn replies(rx: &mut broadcast::Receiver<OutboundMessage>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if msg.chat_action.is_none() {
                out.push(msg.text);
            }
        }
        out
    }

    #[tokio::test]
    async fn general_answers_are_cached() {
        let mut h = harness("cache", Mode::Echo, |_| {});

        h.dispatcher.handle(text_envelope(1, "how do I sort a vec")).await;
        h.dispatcher.handle(text_envelope(1, "how do I sort a vec")).await;

        let replies = replies(&mut h.outbound);
        assert_eq!(replies.len(), 2);
        assert!(replies[0].starts_with("answer #1\n\n_Response time: "));
        assert!(replies[0].ends_with("Model: test-model_"));
        assert!(replies[1].starts_with("answer #1"));
        assert!(replies[1].ends_with("Model: test-model (cached)_"));
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);

        let stats = h.dispatcher.journal.lock().await.stats().expect("stats");
        assert_eq!(stats.exchanges, 2);
        assert_eq!(stats.cached_exchanges, 1);
    }

    #[tokio::test]
    async fn general_prompt_includes_knowledge_files() {
        let mut h = harness("kb", Mode::Echo, |_| {});
        std::fs::create_dir_all(&h.kb_dir).expect("kb dir");
        std::fs::write(h.kb_dir.join("login.py"), "import requests").expect("write");

        h.dispatcher.handle(text_envelope(1, "write me a client")).await;
        let _ = replies(&mut h.outbound);

        let prompts = h.prompts.lock().expect("prompts");
        assert!(prompts[0].contains("Example from login.py:\nimport requests"));
        let _ = std::fs::remove_dir_all(&h.kb_dir);
    }

    #[tokio::test]
    async fn introduction_and_missing_url_skip_the_model() {
        let mut h = harness("intro", Mode::Echo, |config| {
            config.core.bot_name = Some("Hawk".to_string());
        });

        h.dispatcher.handle(text_envelope(1, "who are you?")).await;
        h.dispatcher.handle(text_envelope(1, "can you analyze a website")).await;

        let replies = replies(&mut h.outbound);
        assert!(replies[0].contains("*Hawk*"));
        assert!(replies[0].contains("test-model"));
        assert_eq!(replies[1], "Please send the URL of the website you want me to analyze.");
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn account_bot_name_overrides_core_name() {
        let mut h = harness("account-name", Mode::Echo, |config| {
            config.telegram = Some(kestrel_config::TelegramConfig {
                accounts: vec![TelegramAccount {
                    bot_token: "123456:abc".to_string(),
                    bot_name: Some("Merlin".to_string()),
                    allowed_chats: None,
                }],
                ..Default::default()
            });
        });

        h.dispatcher.handle(text_envelope(1, "/start")).await;
        let replies = replies(&mut h.outbound);
        assert!(replies[0].starts_with("*Merlin*"));
    }

    #[tokio::test]
    async fn denied_chats_get_a_policy_notice() {
        let mut h = harness("deny", Mode::Echo, |config| {
            config.policy = Some(PolicyConfig {
                allowlist: None,
                denylist: Some(vec!["5".to_string()]),
                rate_limit: None,
            });
        });

        h.dispatcher.handle(text_envelope(5, "hello")).await;
        assert_eq!(replies(&mut h.outbound), vec!["Access denied by policy."]);
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn backend_timeout_suggests_simpler_query() {
        let mut h = harness("timeout", Mode::Timeout, |_| {});
        h.dispatcher.handle(text_envelope(1, "explain monads")).await;
        assert_eq!(replies(&mut h.outbound), vec![reply::TIMEOUT_NOTICE]);
    }

    #[tokio::test]
    async fn backend_failure_is_reported_as_error_text() {
        let mut h = harness("fail", Mode::Fail, |_| {});
        h.dispatcher.handle(text_envelope(1, "explain monads")).await;
        assert_eq!(replies(&mut h.outbound), vec!["Error: backend exploded"]);
    }

    #[tokio::test]
    async fn capture_is_summarized_and_journaled() {
        let mut h = harness("capture", Mode::Echo, |_| {});

        h.dispatcher
            .handle(text_envelope(1, "/capture https://shop.test"))
            .await;

        let replies = replies(&mut h.outbound);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].starts_with("Captured 1 of 2 requests from https://shop.test"));
        assert!(replies[0].contains("answer #1"));

        let prompts = h.prompts.lock().expect("prompts").clone();
        assert!(prompts[0].contains("POST https://shop.test/api/cart [fetch] -> 201"));
        assert!(!prompts[0].contains("logo.png"));

        h.dispatcher.handle(text_envelope(1, "/history")).await;
        let history = self::replies(&mut h.outbound);
        assert!(history[0].contains("https://shop.test"));
        assert!(history[0].contains("1 of 2 requests kept"));
    }

    #[tokio::test]
    async fn capture_falls_back_to_raw_report_when_model_fails() {
        let mut h = harness("capture-fail", Mode::Fail, |_| {});

        h.dispatcher
            .handle(text_envelope(1, "capture the traffic of https://shop.test"))
            .await;

        let replies = replies(&mut h.outbound);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].starts_with("Summary unavailable (Error: backend exploded)"));
        assert!(replies[0].contains("Capture of https://shop.test"));
        assert!(replies[0].contains("Requests: 1 kept of 2 observed"));
    }

    #[tokio::test]
    async fn busy_browser_slots_queue_the_capture() {
        let Harness {
            dispatcher,
            mut outbound,
            ..
        } = harness("capture-queued", Mode::Echo, |config| {
            config.capture.max_concurrent_jobs = 1;
        });
        let slot = dispatcher.limiter.try_acquire().expect("free slot");

        let handled = dispatcher.handle(text_envelope(1, "/capture https://shop.test"));
        let release = async {
            let notice = loop {
                let msg = outbound.recv().await.expect("outbound message");
                if msg.chat_action.is_none() {
                    break msg.text;
                }
            };
            drop(slot);
            notice
        };
        let ((), notice) = tokio::join!(handled, release);

        assert_eq!(
            notice,
            "All 1 browser slots are busy. Your capture of https://shop.test is queued."
        );
        let rest = replies(&mut outbound);
        assert_eq!(rest.len(), 1);
        assert!(rest[0].starts_with("Captured 1 of 2 requests from https://shop.test"));
        assert_eq!(dispatcher.limiter.running(), 0);
    }

    #[tokio::test]
    async fn cache_command_reports_and_clears() {
        let mut h = harness("cache-cmd", Mode::Echo, |_| {});

        h.dispatcher.handle(text_envelope(1, "tell me a joke")).await;
        h.dispatcher.handle(text_envelope(1, "/cache")).await;
        h.dispatcher.handle(text_envelope(1, "/cache clear")).await;

        let replies = replies(&mut h.outbound);
        assert!(replies[1].contains("Entries: 1"));
        assert_eq!(replies[2], "Cleared 1 cached responses.");
    }

    #[tokio::test]
    async fn command_usage_and_unknown_commands() {
        let mut h = harness("usage", Mode::Echo, |_| {});

        h.dispatcher.handle(text_envelope(1, "/capture")).await;
        h.dispatcher.handle(text_envelope(1, "/analyze not-a-url")).await;
        h.dispatcher.handle(text_envelope(1, "/frobnicate")).await;
        h.dispatcher.handle(text_envelope(1, "/kb")).await;

        let replies = replies(&mut h.outbound);
        assert_eq!(replies[0], "Usage: /capture <url>");
        assert!(replies[1].starts_with("Usage: /analyze <url>"));
        assert_eq!(replies[2], "Unknown command /frobnicate. Send /help for the list.");
        assert!(replies[3].starts_with("The knowledge base is empty."));
    }

    #[tokio::test]
    async fn analyze_fetches_page_into_prompt() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/login");
            then.status(200)
                .body("<form action=\"/session\"><input name=\"user\"></form>");
        });

        let mut h = harness("analyze", Mode::Echo, |_| {});
        let url = server.url("/login");
        h.dispatcher
            .handle(text_envelope(1, &format!("/analyze {} list the form fields", url)))
            .await;

        let replies = replies(&mut h.outbound);
        assert!(replies[0].starts_with("answer #1"));
        let prompts = h.prompts.lock().expect("prompts");
        assert!(prompts[0].contains("<input name=\"user\">"));
        assert!(prompts[0].contains("list the form fields"));
    }

    #[tokio::test]
    async fn documents_are_stored_and_analyzed() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/bot123456:abc/getFile");
            then.status(200).json_body(serde_json::json!({
                "ok": true,
                "result": { "file_id": "f1", "file_path": "documents/api.py", "file_size": 15 }
            }));
        });
        server.mock(|when, then| {
            when.method(GET).path("/file/bot123456:abc/documents/api.py");
            then.status(200).body("import requests");
        });

        let mut h = harness("document", Mode::Echo, |_| {});
        let account = TelegramAccount {
            bot_token: "123456:abc".to_string(),
            bot_name: None,
            allowed_chats: None,
        };
        let adapter = TelegramAdapter::new(&account, h.kb_dir.clone(), None, None)
            .with_api_base(&server.base_url());
        h.dispatcher.register_adapter(Arc::new(adapter));

        let envelope = Envelope::new(
            "telegram",
            MessageKind::Document {
                from: "42".to_string(),
                file_id: "f1".to_string(),
                file_name: Some("api.py".to_string()),
                caption: Some("find bugs".to_string()),
                file_size: Some(15),
            },
        )
        .with_chat_id(1)
        .with_payload(serde_json::json!({ "account_tag": "123456" }));
        h.dispatcher.handle(envelope).await;

        let replies = replies(&mut h.outbound);
        assert!(replies[0].starts_with("Saved `api.py` to the knowledge base."));
        let stored = std::fs::read_to_string(h.kb_dir.join("api.py")).expect("stored");
        assert_eq!(stored, "import requests");
        let prompts = h.prompts.lock().expect("prompts");
        assert!(prompts[0].contains("find bugs"));
        let _ = std::fs::remove_dir_all(&h.kb_dir);
    }
}
