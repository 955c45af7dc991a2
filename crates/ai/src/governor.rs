//! Token budget accounting and operating-mode selection.
//!
//! Usage is append-only in the relational store; the governor keeps
//! this month's per-provider totals in memory and reloads them when
//! the calendar month (in the configured time zone) rolls over.
//!
//! Mode thresholds on the monthly ratio against the configured
//! ceiling:
//!
//! | ratio        | mode     | effect                                   |
//! |--------------|----------|------------------------------------------|
//! | `< 0.90`     | normal   | everything allowed                       |
//! | `[0.90,0.95)`| degraded | non-essential calls disabled             |
//! | `[0.95,1.00)`| critical | only user-initiated calls allowed        |
//! | `>= 1.00`    | frozen   | no paid calls at all                     |

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::{info, warn};

use notevault_store::{Store, StoreError, rusqlite};

use crate::AiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    Normal,
    Degraded,
    Critical,
    Frozen,
}

impl OperatingMode {
    fn for_ratio(ratio: f64) -> Self {
        if ratio >= 1.00 {
            Self::Frozen
        } else if ratio >= 0.95 {
            Self::Critical
        } else if ratio >= 0.90 {
            Self::Degraded
        } else {
            Self::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitCheck {
    pub allowed: bool,
    pub ratio: f64,
    pub mode: OperatingMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub provider: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_micro_usd: i64,
}

/// USD per 1 000 tokens, `(provider, model, input, output)`.
///
/// Unknown models bill at the most expensive known rate for their
/// provider so gaps in this table overstate rather than understate.
const COST_TABLE: &[(&str, &str, f64, f64)] = &[
    ("openai", "gpt-4o", 0.0025, 0.01),
    ("openai", "gpt-4o-mini", 0.00015, 0.0006),
    ("openai", "text-embedding-3-small", 0.00002, 0.0),
    ("openai", "text-embedding-3-large", 0.00013, 0.0),
    ("openai", "whisper-1", 0.006, 0.0),
    ("anthropic", "claude-sonnet-4-5", 0.003, 0.015),
    ("anthropic", "claude-haiku-4-5", 0.001, 0.005),
    ("gemini", "gemini-2.0-flash", 0.0001, 0.0004),
    ("gemini", "text-embedding-004", 0.00001, 0.0),
];

fn rate_for(provider: &str, model: &str) -> Option<(f64, f64)> {
    COST_TABLE
        .iter()
        .find(|(p, m, _, _)| *p == provider && *m == model)
        .map(|(_, _, input, output)| (*input, *output))
}

fn most_expensive_rate(provider: &str) -> (f64, f64) {
    COST_TABLE
        .iter()
        .filter(|(p, _, _, _)| *p == provider)
        .map(|(_, _, input, output)| (*input, *output))
        .max_by(|a, b| (a.0 + a.1).total_cmp(&(b.0 + b.1)))
        // A provider with no table entries at all bills at the
        // costliest known rate anywhere.
        .unwrap_or((0.01, 0.03))
}

/// Callback invoked once per mode transition per month.
pub type ModeNotifyFn = Arc<dyn Fn(&str, OperatingMode) + Send + Sync>;

struct MonthState {
    /// `(year, month)` in the governor's time zone.
    key: (i32, u32),
    /// provider → tokens (input + output) this month.
    totals: HashMap<String, u64>,
    last_mode: HashMap<String, OperatingMode>,
    notified: HashSet<(String, &'static str)>,
}

pub struct TokenGovernor {
    store: Store,
    monthly_limit: u64,
    zone: Tz,
    state: Mutex<MonthState>,
    warned_models: Mutex<HashSet<String>>,
    notify: Option<ModeNotifyFn>,
}

impl TokenGovernor {
    pub async fn new(store: Store, monthly_limit: u64, zone: Tz) -> Result<Self, StoreError> {
        let key = month_key(Utc::now(), zone);
        let totals = load_month_totals(&store, zone, key).await?;
        Ok(Self {
            store,
            monthly_limit,
            zone,
            state: Mutex::new(MonthState {
                key,
                totals,
                last_mode: HashMap::new(),
                notified: HashSet::new(),
            }),
            warned_models: Mutex::new(HashSet::new()),
            notify: None,
        })
    }

    pub fn set_mode_notifier(&mut self, notify: ModeNotifyFn) {
        self.notify = Some(notify);
    }

    /// Append a usage record and fold it into the monthly totals.
    pub async fn record_usage(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        request_kind: &str,
        actor_id: Option<&str>,
    ) -> Result<(), AiError> {
        let (rate_in, rate_out) = match rate_for(provider, model) {
            Some(rates) => rates,
            None => {
                let key = format!("{provider}/{model}");
                if self.warned_models.lock().expect("warn set").insert(key.clone()) {
                    warn!(model = %key, "no cost table entry, billing at the provider's top rate");
                }
                most_expensive_rate(provider)
            }
        };
        let cost_micro_usd = ((input_tokens as f64 / 1000.0) * rate_in
            + (output_tokens as f64 / 1000.0) * rate_out)
            * 1_000_000.0;
        let cost_micro_usd = cost_micro_usd.round() as i64;

        let row = (
            provider.to_string(),
            model.to_string(),
            input_tokens,
            output_tokens,
            cost_micro_usd,
            request_kind.to_string(),
            actor_id.map(str::to_string),
        );
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO usage_records
                       (provider, model, input_tokens, output_tokens, cost_micro_usd,
                        request_kind, actor_id, occurred_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        row.0,
                        row.1,
                        row.2 as i64,
                        row.3 as i64,
                        row.4,
                        row.5,
                        row.6,
                        Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(AiError::from)?;

        let mut state = self.state.lock().expect("governor state");
        self.roll_month_if_needed(&mut state);
        *state.totals.entry(provider.to_string()).or_insert(0) += input_tokens + output_tokens;
        Ok(())
    }

    /// Current ratio and operating mode for a provider. Emits the
    /// transition notification when the mode changed since the last
    /// check, at most once per (provider, mode) per month.
    pub fn check_limits(&self, provider: &str) -> LimitCheck {
        let mut state = self.state.lock().expect("governor state");
        self.roll_month_if_needed(&mut state);

        let used = state.totals.get(provider).copied().unwrap_or(0);
        let ratio = if self.monthly_limit == 0 {
            0.0
        } else {
            used as f64 / self.monthly_limit as f64
        };
        let mode = OperatingMode::for_ratio(ratio);

        let previous = state.last_mode.insert(provider.to_string(), mode);
        if previous != Some(mode) {
            let tag = mode_tag(mode);
            if state.notified.insert((provider.to_string(), tag)) {
                info!(provider, mode = tag, ratio, "operating mode transition");
                if let Some(notify) = &self.notify {
                    notify(provider, mode);
                }
            }
        }

        LimitCheck {
            allowed: mode != OperatingMode::Frozen,
            ratio,
            mode,
        }
    }

    /// Per-provider totals and cost for the current month, straight
    /// from the store.
    pub async fn monthly_report(&self) -> Result<Vec<UsageReport>, AiError> {
        let since = month_start_utc(month_key(Utc::now(), self.zone), self.zone);
        let since = since.to_rfc3339_opts(SecondsFormat::Micros, true);
        let rows = self
            .store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT provider, SUM(input_tokens), SUM(output_tokens), SUM(cost_micro_usd)
                     FROM usage_records WHERE occurred_at >= ?1
                     GROUP BY provider ORDER BY provider",
                )?;
                let rows = stmt
                    .query_map([since], |row| {
                        Ok(UsageReport {
                            provider: row.get(0)?,
                            input_tokens: row.get::<_, i64>(1)? as u64,
                            output_tokens: row.get::<_, i64>(2)? as u64,
                            cost_micro_usd: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(AiError::from)?;
        Ok(rows)
    }

    fn roll_month_if_needed(&self, state: &mut MonthState) {
        let key = month_key(Utc::now(), self.zone);
        if key != state.key {
            info!(year = key.0, month = key.1, "usage month rolled over");
            state.key = key;
            state.totals.clear();
            state.last_mode.clear();
            state.notified.clear();
        }
    }
}

fn mode_tag(mode: OperatingMode) -> &'static str {
    match mode {
        OperatingMode::Normal => "normal",
        OperatingMode::Degraded => "degraded",
        OperatingMode::Critical => "critical",
        OperatingMode::Frozen => "frozen",
    }
}

fn month_key(now: DateTime<Utc>, zone: Tz) -> (i32, u32) {
    let local = now.with_timezone(&zone);
    (local.year(), local.month())
}

fn month_start_utc(key: (i32, u32), zone: Tz) -> DateTime<Utc> {
    zone.with_ymd_and_hms(key.0, key.1, 1, 0, 0, 0)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

async fn load_month_totals(
    store: &Store,
    zone: Tz,
    key: (i32, u32),
) -> Result<HashMap<String, u64>, StoreError> {
    let since = month_start_utc(key, zone).to_rfc3339_opts(SecondsFormat::Micros, true);
    store
        .with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT provider, SUM(input_tokens + output_tokens)
                 FROM usage_records WHERE occurred_at >= ?1 GROUP BY provider",
            )?;
            let rows = stmt
                .query_map([since], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows.into_iter().collect())
        })
        .await
}

// ── Tests ─────────────────────────────────────────────────────────────────────
