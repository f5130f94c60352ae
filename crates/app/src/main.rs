mod commands;
mod render;
mod settings;

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use murmur_chat::{
    ChatController, ChatError, ChatStatus, ConversationId, ConversationRecord, Role,
    StorageAdapter,
};
use murmur_llm::{ProviderError, create_provider};
use murmur_storage::{SqliteStorage, StorageError};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use commands::{Command, HELP};
use render::{StreamPrinter, status_note, write_conversation_list, write_message};
use settings::{API_KEY_FALLBACK_ENV, SettingsStore};

#[derive(Debug, Snafu)]
enum AppError {
    #[snafu(display("failed to open chat database at {path} on `{stage}`: {source}"))]
    OpenStorage {
        stage: &'static str,
        path: String,
        source: StorageError,
    },
    #[snafu(display("failed to set up provider on `{stage}`: {source}"))]
    CreateProvider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("terminal i/o failed on `{stage}`: {source}"))]
    Terminal {
        stage: &'static str,
        source: std::io::Error,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "murmur exited with an error");
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run() -> Result<(), AppError> {
    let settings_store = SettingsStore::load();
    let settings = settings_store.settings();
    tracing::info!(
        config_path = ?settings_store.config_path(),
        model = %settings.model,
        "settings loaded"
    );

    let provider_config = settings.to_provider_config(std::env::var(API_KEY_FALLBACK_ENV).ok());
    let provider = create_provider(provider_config).context(CreateProviderSnafu {
        stage: "create-provider",
    })?;
    tracing::info!(
        provider = provider.name(),
        provider_id = provider.id(),
        default_model = provider.default_model(),
        "provider ready"
    );

    let database_path = settings.database_location().to_string_lossy().into_owned();
    let storage = SqliteStorage::open(&database_path)
        .await
        .context(OpenStorageSnafu {
            stage: "open-storage",
            path: database_path.clone(),
        })?;
    let store = Arc::new(StorageAdapter::new(Arc::new(storage)));

    let controller = ChatController::new(store, provider, settings.chat_config());
    Repl::new(controller).run().await
}

struct Repl {
    controller: ChatController,
    listing: Vec<ConversationRecord>,
}

impl Repl {
    fn new(controller: ChatController) -> Self {
        Self {
            controller,
            listing: Vec::new(),
        }
    }

    async fn run(mut self) -> Result<(), AppError> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("murmur: type a message, or /help for commands");

        loop {
            print!("> ");
            std::io::stdout().flush().context(TerminalSnafu {
                stage: "flush-prompt",
            })?;

            let Some(line) = lines.next_line().await.context(TerminalSnafu {
                stage: "read-line",
            })?
            else {
                break;
            };

            match Command::parse(&line) {
                Command::Empty => {}
                Command::Quit => break,
                Command::Help => println!("{HELP}"),
                Command::Unknown(input) => println!("unknown command `{input}`, try /help"),
                Command::New => self.report(self.controller.new_conversation()),
                Command::List => self.list().await,
                Command::Open(target) => self.open(&target).await,
                Command::Delete(target) => self.delete(&target).await,
                Command::Retry => {
                    let result = self.controller.regenerate_last().await;
                    self.after_submit(result).await?;
                }
                Command::Send(text) => {
                    let result = self.controller.send(&text).await;
                    self.after_submit(result).await?;
                }
            }
        }

        self.controller.stop();
        Ok(())
    }

    async fn after_submit<T>(&self, result: Result<T, ChatError>) -> Result<(), AppError> {
        match result {
            Ok(_) => self.stream_reply().await,
            Err(error) => {
                println!("{error}");
                Ok(())
            }
        }
    }

    /// Prints the reply as it streams; ctrl-c stops it.
    async fn stream_reply(&self) -> Result<(), AppError> {
        let mut state_rx = self.controller.subscribe();
        let mut printer = StreamPrinter::new();
        let mut stdout = std::io::stdout();
        let mut header_printed = false;

        loop {
            let state = state_rx.borrow_and_update().clone();
            if let Some(message) = state
                .messages
                .last()
                .filter(|message| message.role == Role::Assistant)
            {
                if !header_printed {
                    print!("assistant> ");
                    header_printed = true;
                }
                printer
                    .update(&message.parts, &mut stdout)
                    .context(TerminalSnafu {
                        stage: "print-reply",
                    })?;
            }

            if state.is_settled() {
                let note = state.messages.last().and_then(|message| status_note(&message.status));
                match note {
                    Some(note) => println!(" {note}"),
                    None => println!(),
                }
                if state.status == ChatStatus::Error
                    && let Some(error) = &state.error
                {
                    println!("error: {error}");
                }
                return Ok(());
            }

            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    self.controller.stop();
                }
            }
        }
    }

    async fn list(&mut self) {
        match self.controller.list_conversations().await {
            Ok(conversations) => {
                let mut stdout = std::io::stdout();
                if let Err(error) = write_conversation_list(&conversations, now_millis(), &mut stdout)
                {
                    tracing::warn!(error = %error, "failed to print conversation list");
                }
                self.listing = conversations;
            }
            Err(error) => println!("{error}"),
        }
    }

    async fn open(&mut self, target: &str) {
        let Some(conversation_id) = self.resolve(target) else {
            println!("no conversation `{target}`, run /list first");
            return;
        };

        match self.controller.select_conversation(conversation_id).await {
            Ok(()) => {
                let mut stdout = std::io::stdout();
                for message in &self.controller.state().messages {
                    if let Err(error) = write_message(message, &mut stdout) {
                        tracing::warn!(error = %error, "failed to print message");
                        break;
                    }
                }
            }
            Err(error) => println!("{error}"),
        }
    }

    async fn delete(&mut self, target: &str) {
        let Some(conversation_id) = self.resolve(target) else {
            println!("no conversation `{target}`, run /list first");
            return;
        };

        match self.controller.delete_conversation(conversation_id).await {
            Ok(()) => {
                self.listing
                    .retain(|conversation| conversation.id != conversation_id);
                println!("deleted");
            }
            Err(error) => println!("{error}"),
        }
    }

    fn resolve(&self, target: &str) -> Option<ConversationId> {
        if let Ok(index) = target.parse::<usize>() {
            return index
                .checked_sub(1)
                .and_then(|index| self.listing.get(index))
                .map(|conversation| conversation.id);
        }
        ConversationId::parse(target).ok()
    }

    fn report(&self, result: Result<(), ChatError>) {
        match result {
            Ok(()) => println!("started a new conversation"),
            Err(error) => println!("{error}"),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
