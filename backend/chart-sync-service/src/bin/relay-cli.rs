use std::env;

use chart_sync_service::error::RelayError;
use chart_sync_service::models::EntityKind;
use chart_sync_service::state::{admin, consumer_stream, CheckpointStore, RedisState};
use chrono::{DateTime, Utc};
use redis_utils::RedisPool;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage:");
        eprintln!("  relay-cli status <stream>");
        eprintln!("  relay-cli replay-since <stream> <rfc3339_ts>");
        eprintln!("  relay-cli clear-dirty <stream>");
        eprintln!();
        eprintln!("Streams: lab_results, patients. Redis is read from REDIS_URL.");
        std::process::exit(1);
    }

    let cmd = args[1].as_str();
    let entity: EntityKind = args[2].parse()?;
    let stream = entity.stream_name();

    let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let pool = RedisPool::connect(&redis_url).await?;
    let state = RedisState::new(pool.manager());

    match cmd {
        "status" if args.len() == 3 => {
            let dirty = state.dirty_bit(stream).await?;
            let relay = state.watermark(stream).await?;
            let consumer = state.watermark(&consumer_stream(stream)).await?;

            println!("stream:             {}", stream);
            println!("dirty bit:          {}", dirty);
            println!("relay watermark:    {}", display(relay));
            println!("consumer watermark: {}", display(consumer));
            match (relay, consumer) {
                (Some(relay), Some(consumer)) => {
                    println!("consumer lag:       {}s", (relay - consumer).num_seconds().max(0));
                }
                _ => println!("consumer lag:       unknown"),
            }
        }
        "replay-since" if args.len() == 4 => {
            let ts: DateTime<Utc> = DateTime::parse_from_rfc3339(&args[3])?.with_timezone(&Utc);
            exit_if_busy(admin::replay_since(&state, &state, stream, ts).await)?;
            println!(
                "Next {} cycle will backfill changes since {}",
                stream, ts
            );
        }
        "clear-dirty" if args.len() == 3 => {
            exit_if_busy(admin::clear_dirty(&state, &state, stream).await)?;
            println!("Cleared dirty bit for {}", stream);
        }
        _ => {
            eprintln!("Invalid arguments");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn exit_if_busy(result: Result<(), RelayError>) -> Result<(), RelayError> {
    if let Err(RelayError::LockUnavailable(stream)) = &result {
        eprintln!("relay busy: {} is locked by a running cycle, try again", stream);
        std::process::exit(1);
    }
    result
}

fn display(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
}
