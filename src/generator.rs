//! Synthetic application log records for exercising the pipeline.
//!
//! Emits one JSON object per line at a fixed rate. The streaming agent picks
//! these up from stdout; `aggregate` later counts them by `action`.

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use rand::seq::IndexedRandom;
use serde::Serialize;
use snafu::prelude::*;
use std::io::Write;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Builder;

use crate::emit;
use crate::error::{
    GenerateError, InvalidDurationSnafu, InvalidRateSnafu, SerializeRecordSnafu, WriteRecordSnafu,
};
use crate::metrics::events::RecordsGenerated;

const USER_POOL_SIZE: usize = 50;

/// Share of a sentence-style message instead of a fixed template.
const FREEFORM_MESSAGE_CHANCE: f64 = 0.4;

/// ERROR-level records carry the ERROR action this often.
const ERROR_ACTION_BIAS: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl Level {
    /// INFO 80%, WARNING 15%, ERROR 5%.
    fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
        match rng.random_range(0..100) {
            0..80 => Level::Info,
            80..95 => Level::Warning,
            _ => Level::Error,
        }
    }

    /// Response time bounds in milliseconds.
    fn response_time_ms(&self) -> (u64, u64) {
        match self {
            Level::Info => (10, 2_000),
            Level::Warning => (500, 5_000),
            Level::Error => (2_000, 30_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Login,
    Logout,
    Purchase,
    View,
    Search,
    Click,
    Error,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Action::Login,
        Action::Logout,
        Action::Purchase,
        Action::View,
        Action::Search,
        Action::Click,
        Action::Error,
    ];

    fn templates(&self) -> &'static [&'static str] {
        match self {
            Action::Login => &[
                "User authenticated successfully",
                "Session started",
                "Login attempt from device",
            ],
            Action::Logout => &["User signed out", "Session terminated", "Logout requested"],
            Action::Purchase => &["Order completed", "Payment processed", "Checkout successful"],
            Action::View => &["Product page viewed", "Page load completed", "Content displayed"],
            Action::Search => &["Search query executed", "Results returned", "Search performed"],
            Action::Click => &["Button clicked", "Link followed", "Element interaction"],
            Action::Error => &["Operation failed", "Request timeout", "Unexpected error"],
        }
    }
}

const WORDS: &[&str] = &[
    "account", "active", "basket", "browser", "cache", "catalog", "client", "device", "display",
    "item", "latency", "mobile", "network", "profile", "quickly", "request", "response", "review",
    "secure", "session", "update", "user", "window",
];

const NAME_PARTS: &[&str] = &[
    "amber", "brook", "cedar", "delta", "ember", "fern", "grove", "harbor", "iris", "juniper",
    "kestrel", "linden", "maple", "north", "onyx", "pine", "quartz", "river", "sage", "tide",
];

/// One generated log line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    /// RFC 3339, UTC.
    pub timestamp: String,
    pub level: Level,
    pub user_id: String,
    pub action: Action,
    pub message: String,
    /// Milliseconds.
    pub response_time: u64,
    pub ip: String,
}

/// Validated generator settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeneratorConfig {
    /// Records per second.
    pub rate: f64,
    /// `None` runs until cancelled.
    pub duration: Option<Duration>,
}

impl GeneratorConfig {
    /// `rate` must be positive; `duration` of 0 means unbounded.
    pub fn new(rate: f64, duration_secs: f64) -> Result<Self, GenerateError> {
        ensure!(rate.is_finite() && rate > 0.0, InvalidRateSnafu { rate });
        ensure!(
            duration_secs.is_finite() && duration_secs >= 0.0,
            InvalidDurationSnafu {
                duration: duration_secs
            }
        );
        Ok(Self {
            rate,
            duration: (duration_secs > 0.0).then(|| Duration::from_secs_f64(duration_secs)),
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate)
    }
}

/// Produces records from a fixed pool of users.
pub struct LogGenerator<R> {
    rng: R,
    users: Vec<String>,
}

impl<R: Rng> LogGenerator<R> {
    pub fn new(mut rng: R) -> Self {
        let users = user_pool(&mut rng, USER_POOL_SIZE);
        Self { rng, users }
    }

    pub fn users(&self) -> &[String] {
        &self.users
    }

    pub fn next_record(&mut self, now: DateTime<Utc>) -> LogRecord {
        let rng = &mut self.rng;
        let level = Level::sample(rng);
        let mut action = Action::ALL.choose(rng).copied().unwrap_or(Action::View);
        if level == Level::Error && rng.random_bool(ERROR_ACTION_BIAS) {
            action = Action::Error;
        }

        let message = if rng.random_bool(FREEFORM_MESSAGE_CHANCE) {
            sentence(rng)
        } else {
            action
                .templates()
                .choose(rng)
                .map(|m| m.to_string())
                .unwrap_or_default()
        };

        let (low, high) = level.response_time_ms();
        LogRecord {
            timestamp: now.to_rfc3339_opts(SecondsFormat::Micros, false),
            level,
            user_id: self.users.choose(rng).cloned().unwrap_or_default(),
            action,
            message,
            response_time: rng.random_range(low..=high),
            ip: public_ipv4(rng),
        }
    }
}

/// Half readable handles, half v4 UUIDs drawn from `rng` so seeded pools repeat.
fn user_pool<R: Rng + ?Sized>(rng: &mut R, size: usize) -> Vec<String> {
    let mut pool: Vec<String> = (0..size / 2)
        .map(|_| {
            let first = NAME_PARTS.choose(rng).copied().unwrap_or("user");
            let second = NAME_PARTS.choose(rng).copied().unwrap_or("id");
            format!("{first}_{second}{}", rng.random_range(1..100))
        })
        .collect();
    while pool.len() < size {
        let id = Builder::from_random_bytes(rng.random()).into_uuid();
        pool.push(id.to_string());
    }
    pool
}

fn sentence<R: Rng + ?Sized>(rng: &mut R) -> String {
    let len = rng.random_range(3..=5);
    let words: Vec<&str> = (0..len)
        .filter_map(|_| WORDS.choose(rng).copied())
        .collect();
    let mut text = String::new();
    if let Some(first) = words.first() {
        let mut chars = first.chars();
        if let Some(c) = chars.next() {
            text.extend(c.to_uppercase());
            text.push_str(chars.as_str());
        }
    }
    for word in words.iter().skip(1) {
        text.push(' ');
        text.push_str(word);
    }
    text
}

/// Unicast address outside private, loopback, and link-local ranges.
fn public_ipv4<R: Rng + ?Sized>(rng: &mut R) -> String {
    loop {
        let octets: [u8; 4] = [
            rng.random_range(1..=223),
            rng.random(),
            rng.random(),
            rng.random_range(1..=254),
        ];
        let private = matches!(
            octets,
            [10, ..] | [127, ..] | [169, 254, ..] | [192, 168, ..] | [100, 64..=127, ..]
        ) || (octets[0] == 172 && (16..=31).contains(&octets[1]));
        if !private {
            return format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]);
        }
    }
}

/// Write records to `out` until the duration elapses or `shutdown` fires.
///
/// Returns the number of records written.
pub async fn run<R: Rng, W: Write>(
    generator: &mut LogGenerator<R>,
    config: GeneratorConfig,
    mut out: W,
    shutdown: CancellationToken,
) -> Result<u64, GenerateError> {
    let interval = config.interval();
    let deadline = config.duration.map(|d| Instant::now() + d);
    let mut written = 0u64;

    info!(rate = config.rate, duration = ?config.duration, "Generating log records");

    loop {
        let record = generator.next_record(Utc::now());
        let line = serde_json::to_string(&record).context(SerializeRecordSnafu)?;
        writeln!(out, "{line}").context(WriteRecordSnafu)?;
        out.flush().context(WriteRecordSnafu)?;
        written += 1;
        emit!(RecordsGenerated { count: 1 });

        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!("Generator cancelled");
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!(records = written, "Generator stopped");
    Ok(written)
}
