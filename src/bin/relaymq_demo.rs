//! relaymq-demo: interactive publisher/subscriber pair.
//!
//! ```text
//! relaymq-demo sub [--config relaymq.yaml]   # answers log.pub, prints log.send
//! relaymq-demo pub [--config relaymq.yaml]   # one log.pub request + log.send per stdin line
//! ```
//!
//! ## Configuration
//! - RELAYMQ_CONFIG: Path to a YAML config file
//! - RELAYMQ__SERVER__URL: Broker URL (default amqp://localhost)
//! - RELAYMQ_LOG: Log filter (default info)

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use relaymq::utils::bootstrap::{init_tracing, parse_config_path};
use relaymq::{BoxError, Emitter, EmitterConfig, EmitterEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mode = std::env::args()
        .nth(1)
        .filter(|arg| arg == "pub" || arg == "sub")
        .ok_or("usage: relaymq-demo <pub|sub> [--config <path>]")?;

    let config_path = parse_config_path();
    let config = EmitterConfig::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let emitter = Emitter::amqp(config);
    let mut events = emitter.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EmitterEvent::Connected => println!("connected"),
                EmitterEvent::Disconnected(reason) => println!("disconnected: {}", reason),
                EmitterEvent::Error(e) => println!("error: {}", e),
            }
        }
    });

    info!("Connecting");
    emitter.connect().await?;

    match mode.as_str() {
        "sub" => subscribe(&emitter).await?,
        _ => publish(&emitter).await?,
    }

    emitter.disconnect("demo finished").await;
    Ok(())
}

async fn subscribe(emitter: &Emitter) -> Result<(), Box<dyn std::error::Error>> {
    emitter
        .on_one("log.pub", |_event: String, body: Value| async move {
            let line = line_of(&body);
            println!("One {}", line);
            Ok::<Value, BoxError>(json!(format!("ACK {}", line)))
        })
        .await?;

    emitter
        .on_all("log.send", |_event: String, body: Value| async move {
            println!("All {}", line_of(&body));
            Ok::<Value, BoxError>(Value::Null)
        })
        .await?;

    println!("Waiting for messages");
    tokio::signal::ctrl_c().await?;
    Ok(())
}

async fn publish(emitter: &Emitter) -> Result<(), Box<dyn std::error::Error>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match emitter.emit_one("log.pub", json!({ "line": line })).await {
            Ok(response) => println!("{}", response),
            Err(e) => warn!(error = %e, "Request failed"),
        }
        if let Err(e) = emitter.emit_all("log.send", json!({ "line": line })).await {
            warn!(error = %e, "Broadcast failed");
        }
    }
    Ok(())
}

fn line_of(body: &Value) -> String {
    body.get("line")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
