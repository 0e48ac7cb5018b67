use anyhow::{Context, Result};
use chrono::Utc;
use rustyline::error::ReadlineError;
use std::io::{self, Write};
use std::sync::Arc;
use uuid::Uuid;

use hearth::app::events::LoggingHandler;
use hearth::app::multiplexer::FnListener;
use hearth::core::context::truncate_context;
use hearth::infra::store::{ConversationEntry, EntryStore, GenerationStatus, JsonEntryStore};
use hearth::infra::{CandleEngineFactory, LocalAssetManager};
use hearth::{BrokerError, ChatMessage, ConversationMultiplexer, EnvConfig, EventBus, ModelBroker, ModelId, RecoveryService};

use crate::format::{human_age, human_tokens};
use crate::progress::LoadProgress;

const COLOR_DEFAULT: &str = "\x1b[0m";
const COLOR_GREY: &str = "\x1b[90m";
const COLOR_YELLOW: &str = "\x1b[93m";

/// Everything the commands share, wired from the environment.
struct Runtime {
    multiplexer: ConversationMultiplexer,
    store: Arc<JsonEntryStore>,
    recovery: RecoveryService,
}

impl Runtime {
    fn build(config: &EnvConfig) -> Result<Self> {
        let events = Arc::new(EventBus::new());
        events.subscribe(LoggingHandler);
        events.subscribe(LoadProgress::new());

        let broker = ModelBroker::new(
            Arc::new(CandleEngineFactory::new(config.sampling)),
            Arc::new(LocalAssetManager::new(&config.models_dir)),
            events,
            config.broker_config(),
        );
        let multiplexer = ConversationMultiplexer::new(broker);

        let store = Arc::new(
            JsonEntryStore::open(&config.store_path)
                .with_context(|| format!("opening store {}", config.store_path.display()))?,
        );
        let recovery = RecoveryService::new(store.clone(), multiplexer.clone(), config.recovery_config());

        Ok(Self {
            multiplexer,
            store,
            recovery,
        })
    }

    async fn shutdown(&self) {
        self.multiplexer.destroy().await;
    }
}

pub fn models(config: &EnvConfig) -> Result<()> {
    let assets = LocalAssetManager::new(&config.models_dir);

    println!("{:<26} {:<28} {:>8}  {}", "ID", "NAME", "CONTEXT", "FILES");
    for model in ModelId::ALL {
        let files = if assets.is_present(&model) { "present" } else { "missing" };
        println!(
            "{:<26} {:<28} {:>8}  {}",
            model.as_str(),
            model.display_name(),
            human_tokens(model.context_limit()),
            files
        );
    }
    println!("\nmodels directory: {}", assets.models_dir().display());
    Ok(())
}

pub async fn chat(config: &EnvConfig, model: &str, conversation: Option<String>) -> Result<()> {
    let model: ModelId = model.parse()?;
    let runtime = Runtime::build(config)?;
    let conversation = conversation.unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut transcript = match runtime.store.get(&conversation).await? {
        Some(entry) => {
            println!("{}continuing {} ({} messages){}", COLOR_GREY, conversation, entry.blocks.len(), COLOR_DEFAULT);
            entry.blocks
        }
        None => {
            runtime.store.upsert(ConversationEntry::new(conversation.clone())).await?;
            Vec::new()
        }
    };

    let listener = Arc::new(FnListener::new(
        |token| {
            let mut stdout = io::stdout();
            write!(stdout, "{}", token)?;
            stdout.flush()?;
            Ok(())
        },
        |_| Ok(()),
    ));
    let handle = runtime
        .multiplexer
        .get_or_create(conversation.as_str(), model, listener)
        .await?;

    println!(">>> Chatting with {} (conversation {})", model.display_name(), conversation);
    println!("Press Ctrl-C to stop a reply, /exit to quit");

    let mut editor = rustyline::DefaultEditor::new()?;
    loop {
        let line = match editor.readline(">>> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/exit" || line == "/bye" {
            break;
        }
        let _ = editor.add_history_entry(line);

        transcript.push(ChatMessage::user(line));
        runtime
            .store
            .upsert(ConversationEntry {
                id: conversation.clone(),
                blocks: transcript.clone(),
                generation_status: Some(GenerationStatus::Generating),
                generation_started_at: Some(Utc::now()),
                generation_model_id: Some(model.as_str().to_string()),
            })
            .await?;

        let window = truncate_context(&transcript, model.as_str());
        let generation = handle.generate(window);
        tokio::pin!(generation);
        let settled = tokio::select! {
            outcome = &mut generation => Some(outcome),
            _ = tokio::signal::ctrl_c() => None,
        };
        let outcome = match settled {
            Some(outcome) => outcome,
            None => {
                handle.interrupt();
                generation.await
            }
        };
        println!();

        match outcome {
            Ok(reply) => {
                transcript.push(ChatMessage::assistant(reply));
                runtime.store.set_blocks(&conversation, transcript.clone()).await?;
                runtime
                    .store
                    .set_generation_status(&conversation, GenerationStatus::Completed, None)
                    .await?;
            }
            Err(err) => {
                report_failure(&err);
                runtime
                    .store
                    .set_generation_status(&conversation, GenerationStatus::Failed, None)
                    .await?;
            }
        }
    }

    handle.delete();
    runtime.shutdown().await;
    Ok(())
}

fn report_failure(err: &BrokerError) {
    if err.is_cancellation() {
        println!("{}[reply stopped]{}", COLOR_YELLOW, COLOR_DEFAULT);
    } else {
        eprintln!("Error: {}", err);
    }
}

pub async fn recover(config: &EnvConfig, resume: bool, dismiss: bool) -> Result<()> {
    let runtime = Runtime::build(config)?;
    let pending = runtime.recovery.check_for_incomplete_generations().await?;
    if pending.is_empty() {
        println!("No interrupted generations.");
        return Ok(());
    }

    let now = Utc::now();
    println!("{:<38} {:<28} {}", "CONVERSATION", "MODEL", "STARTED");
    for generation in &pending {
        println!(
            "{:<38} {:<28} {}",
            generation.entry_id,
            generation.model_name,
            human_age(generation.started_at, now)
        );
    }

    if dismiss {
        for generation in &pending {
            runtime.recovery.dismiss(generation).await?;
        }
        println!("Dismissed {} generation(s).", pending.len());
    } else if resume {
        for generation in &pending {
            println!("\n>>> resuming {}", generation.entry_id);
            let listener = Arc::new(FnListener::new(
                |token| {
                    let mut stdout = io::stdout();
                    write!(stdout, "{}", token)?;
                    stdout.flush()?;
                    Ok(())
                },
                |_| Ok(()),
            ));
            match runtime.recovery.resume(generation, Some(listener)).await {
                Ok(_) => println!(),
                Err(err) => eprintln!("\nError: {}", err),
            }
        }
    }

    runtime.shutdown().await;
    Ok(())
}
