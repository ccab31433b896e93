use std::io::Read;

use clap::{Parser, Subcommand};
use redis::streams::{StreamId, StreamRangeReply};
use redis::AsyncCommands;
use tokio::sync::watch;

use karigo_common::events::{topics, DeadLetter, DomainEvent, EventEnvelope};
use karigo_common::{publish_event, EventBusConfig, RedisConfig, RedisService, RedisStreamEventBus};

const TOPICS: [&str; 6] = [
    topics::PAYMENT_INTENT,
    topics::PAYMENT_CAPTURED,
    topics::PAYMENT_REFUNDED,
    topics::PAYMENT_FAILED,
    topics::RIDE_PUBLISHED,
    topics::RIDE_UPDATED,
];

#[derive(Parser)]
#[command(name = "bus-cli")]
#[command(about = "KariGo Event Bus CLI Tool")]
struct Cli {
    /// Redis URL override
    #[arg(long, global = true)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Test the Redis connection
    Ping,
    /// Show the length of every topic stream and its dead-letter stream
    Streams,
    /// Inspect or replay dead letters
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },
    /// Publish an event envelope read from a file, or stdin when omitted
    Publish {
        file: Option<String>,
    },
}

#[derive(Subcommand)]
enum DlqCommands {
    /// List dead letters of a topic, oldest first
    List {
        topic: String,
        #[arg(long, default_value_t = 20)]
        count: usize,
    },
    /// Republish dead-lettered events to their topic and remove them from the DLQ
    Replay {
        topic: String,
        #[arg(long, default_value_t = 100)]
        count: usize,
        /// Only show what would be replayed
        #[arg(long)]
        dry_run: bool,
    },
}

/// A dead-letter stream entry.
#[derive(Debug)]
enum DlqEntry {
    /// An event a consumer gave up on.
    Letter(DeadLetter),
    /// A message that never decoded.
    Raw {
        reason: String,
        error: String,
        payload: String,
    },
}

impl DlqEntry {
    fn classify(payload: Option<String>, reason: Option<String>, error: Option<String>) -> Self {
        if let Some(Ok(envelope)) = payload.as_deref().map(EventEnvelope::decode) {
            if let DomainEvent::DeadLetter(letter) = envelope.event {
                return DlqEntry::Letter(letter);
            }
        }
        DlqEntry::Raw {
            reason: reason.unwrap_or_else(|| "undecodable".to_string()),
            error: error.unwrap_or_default(),
            payload: payload.unwrap_or_default(),
        }
    }

    fn from_stream(entry: &StreamId) -> Self {
        Self::classify(entry.get("payload"), entry.get("reason"), entry.get("error"))
    }

    fn summary(&self) -> String {
        match self {
            DlqEntry::Letter(letter) => format!(
                "{} event={} reason={} attempts={} error={}",
                letter.original.event.type_name(),
                letter.original.event_id,
                letter.reason,
                letter.attempts,
                letter.error
            ),
            DlqEntry::Raw { reason, error, payload } => {
                format!("raw reason={} error={} payload={}", reason, error, payload)
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = redis_config(cli.redis_url.as_deref())?;
    let redis = RedisService::new(&config).await?;

    match cli.command {
        Commands::Ping => {
            redis.health_check().await?;
            println!("✅ Redis connection successful");
        }
        Commands::Streams => {
            let mut conn = redis.connection();
            for topic in TOPICS {
                let len: usize = conn.xlen(topic).await?;
                let dlq_len: usize = conn.xlen(topics::dead_letter(topic)).await?;
                println!("{:<20} {:>8} entries {:>6} dead letters", topic, len, dlq_len);
            }
        }
        Commands::Dlq {
            command: DlqCommands::List { topic, count },
        } => {
            let entries = read_dead_letters(&redis, &topic, count).await?;
            if entries.is_empty() {
                println!("✅ No dead letters for {}", topic);
            }
            for (id, entry) in &entries {
                println!("{} {}", id, entry.summary());
            }
        }
        Commands::Dlq {
            command: DlqCommands::Replay { topic, count, dry_run },
        } => {
            let (_shutdown_tx, shutdown_rx) = watch::channel(false);
            let bus = RedisStreamEventBus::new(redis.clone(), EventBusConfig::from_env("bus-cli"), shutdown_rx);
            let dlq = topics::dead_letter(&topic);
            let mut conn = redis.connection();

            let mut replayed = 0;
            for (id, entry) in read_dead_letters(&redis, &topic, count).await? {
                let DlqEntry::Letter(letter) = entry else {
                    println!("⏭️  {} skipped, not an event envelope", id);
                    continue;
                };
                if dry_run {
                    println!("🔁 {} would replay event {}", id, letter.original.event_id);
                    continue;
                }

                // Same event id, so consumers that already handled it skip it
                publish_event(&bus, &letter.original).await?;
                let _: i64 = conn.xdel(&dlq, &[&id]).await?;
                tracing::info!(topic = %topic, entry_id = %id, event_id = %letter.original.event_id, "Replayed dead letter");
                replayed += 1;
            }
            println!("✅ Replayed {} dead letters to {}", replayed, topic);
        }
        Commands::Publish { file } => {
            let payload = match file {
                Some(path) => std::fs::read_to_string(path)?,
                None => {
                    let mut buffer = String::new();
                    std::io::stdin().read_to_string(&mut buffer)?;
                    buffer
                }
            };
            let envelope = EventEnvelope::decode(&payload)?;

            let (_shutdown_tx, shutdown_rx) = watch::channel(false);
            let bus = RedisStreamEventBus::new(redis, EventBusConfig::from_env("bus-cli"), shutdown_rx);
            publish_event(&bus, &envelope).await?;
            println!("✅ Published {} to {}", envelope.event_id, envelope.topic());
        }
    }

    Ok(())
}

async fn read_dead_letters(
    redis: &RedisService,
    topic: &str,
    count: usize,
) -> anyhow::Result<Vec<(String, DlqEntry)>> {
    let mut conn = redis.connection();
    let reply: StreamRangeReply = conn
        .xrange_count(topics::dead_letter(topic), "-", "+", count)
        .await?;
    Ok(reply
        .ids
        .iter()
        .map(|entry| (entry.id.clone(), DlqEntry::from_stream(entry)))
        .collect())
}

fn redis_config(redis_url: Option<&str>) -> anyhow::Result<RedisConfig> {
    let Some(url) = redis_url else {
        return Ok(RedisConfig::from_env());
    };

    let url = url::Url::parse(url)?;
    Ok(RedisConfig {
        host: url.host_str().unwrap_or("localhost").to_string(),
        port: url.port().unwrap_or(6379),
        password: url.password().map(|p| p.to_string()),
        database: url.path().trim_start_matches('/').parse().unwrap_or(0),
    })
}
