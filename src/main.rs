use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use yotei_agent::engine::Engine;
use yotei_core::config::Config;
use yotei_core::types::ChatMessage;

#[tokio::main]
async fn main() {
    let config_path = std::env::var("YOTEI_CONFIG").unwrap_or_else(|_| "yotei.toml".to_string());

    let config = Config::load(Path::new(&config_path)).unwrap_or_else(|e| {
        eprintln!("fatal: failed to load config: {e}");
        std::process::exit(1);
    });

    if config.llm.api_key.is_empty() {
        eprintln!("fatal: YOTEI_LLM_API_KEY is not set");
        std::process::exit(1);
    }

    let engine = Engine::new(config).await.unwrap_or_else(|e| {
        eprintln!("fatal: failed to initialize engine: {e}");
        std::process::exit(1);
    });

    eprintln!("yotei: ready (exit で終了)");

    let mut history: Vec<ChatMessage> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let _ = stdout.write_all(b"> ").await;
        let _ = stdout.flush().await;

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                eprintln!("fatal: stdin error: {e}");
                break;
            }
        };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "exit" || input == "quit" {
            break;
        }

        history.push(ChatMessage::user(input));
        let outcome = engine.process_chat(&history, true).await;
        history.push(ChatMessage::assistant(outcome.reply.clone()));

        let _ = stdout
            .write_all(format!("{}\n", outcome.reply).as_bytes())
            .await;
        let _ = stdout.flush().await;
    }
}
