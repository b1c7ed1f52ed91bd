use crate::optimize::model::{JobRequest, JobState};
use crate::optimize::space::{ParamRange, ParamSpace};
use crate::optimize::walk_forward::WalkForwardConfig;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::OnceLock;

pub const USAGE: &str = "commands: optimize <strategy> <param=a,b,c|param=min..max>... [budget=N] [priority=N] [plateau=N] [seed=N] [folds=N@LEN] [id=ID] | backtest <strategy> <param=...>... [priority=N] [id=ID] | get <id> | list [state] | cancel <id> | cleanup [age] | status [id] | help | quit";

const DEFAULT_BUDGET: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum AppCommand {
    Submit(Box<JobRequest>),
    Get { id: String },
    List { state: Option<JobState> },
    Cancel { id: String },
    /// `None` uses the configured retention window.
    Cleanup { max_age_secs: Option<u64> },
    /// Scheduler counters, or one job's in-memory status.
    Status { id: Option<String> },
    Help,
    Quit,
    Unknown(String),
}

impl FromStr for AppCommand {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        if parts.is_empty() {
            return Ok(AppCommand::Unknown("".to_string()));
        }

        match parts[0] {
            "optimize" | "opt" => Ok(parse_submit(&parts[1..], false)
                .unwrap_or_else(|msg| AppCommand::Unknown(format!("optimize: {}", msg)))),
            "backtest" | "bt" => Ok(parse_submit(&parts[1..], true)
                .unwrap_or_else(|msg| AppCommand::Unknown(format!("backtest: {}", msg)))),
            "get" => match parts.get(1) {
                Some(id) => Ok(AppCommand::Get { id: id.to_string() }),
                None => Ok(AppCommand::Unknown("usage: get <id>".to_string())),
            },
            "list" | "ls" => match parts.get(1) {
                None => Ok(AppCommand::List { state: None }),
                Some(raw) => match raw.parse::<JobState>() {
                    Ok(state) => Ok(AppCommand::List { state: Some(state) }),
                    Err(msg) => Ok(AppCommand::Unknown(msg)),
                },
            },
            "cancel" | "stop" => match parts.get(1) {
                Some(id) => Ok(AppCommand::Cancel { id: id.to_string() }),
                None => Ok(AppCommand::Unknown("usage: cancel <id>".to_string())),
            },
            "cleanup" => match parts.get(1) {
                None => Ok(AppCommand::Cleanup { max_age_secs: None }),
                Some(raw) => match parse_interval_seconds(raw) {
                    Some(secs) => Ok(AppCommand::Cleanup {
                        max_age_secs: Some(secs),
                    }),
                    None => Ok(AppCommand::Unknown(format!("invalid age: {}", raw))),
                },
            },
            "status" => Ok(AppCommand::Status {
                id: parts.get(1).map(|s| s.to_string()),
            }),
            "help" | "h" => Ok(AppCommand::Help),
            "quit" | "q" | "exit" => Ok(AppCommand::Quit),
            _ => Ok(AppCommand::Unknown(format!("unknown command: {}", parts[0]))),
        }
    }
}

enum ParamSpec {
    Values(Vec<Value>),
    Bounds(ParamRange),
}

fn range_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(-?\d+(?:\.\d+)?)\.\.(-?\d+(?:\.\d+)?)$").expect("static range pattern")
    })
}

fn parse_submit(args: &[&str], backtest: bool) -> Result<AppCommand, String> {
    let Some((strategy, rest)) = args.split_first() else {
        return Err("missing strategy".to_string());
    };
    if strategy.contains('=') {
        return Err("first argument must be the strategy".to_string());
    }

    let mut grid: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    let mut bounds: BTreeMap<String, ParamRange> = BTreeMap::new();
    let mut budget = DEFAULT_BUDGET;
    let mut id = None;
    let mut priority = 0;
    let mut plateau = None;
    let mut seed = None;
    let mut walk_forward = None;

    for arg in rest {
        let Some((key, value)) = arg.split_once('=') else {
            return Err(format!("expected key=value, got {}", arg));
        };
        if value.is_empty() {
            return Err(format!("{} has no value", key));
        }
        match key {
            "budget" => budget = parse_num(key, value)?,
            "priority" => priority = parse_num(key, value)?,
            "plateau" => plateau = Some(parse_num(key, value)?),
            "seed" => seed = Some(parse_num(key, value)?),
            "id" => id = Some(value.to_string()),
            "folds" => walk_forward = Some(parse_folds(value)?),
            name => match parse_param(value) {
                ParamSpec::Values(values) => {
                    grid.insert(name.to_string(), values);
                }
                ParamSpec::Bounds(range) => {
                    bounds.insert(name.to_string(), range);
                }
            },
        }
    }

    let space = match (grid.is_empty(), bounds.is_empty()) {
        (false, true) => ParamSpace::Grid { values: grid },
        (true, false) => ParamSpace::Range { bounds },
        (true, true) => return Err("no parameters given".to_string()),
        (false, false) => return Err("cannot mix value lists and ranges".to_string()),
    };

    let mut request = if backtest {
        JobRequest::backtest(*strategy, space)
    } else {
        JobRequest::optimize(*strategy, space, budget)
    };
    request = request.priority(priority);
    if let Some(id) = id {
        request = request.with_id(id);
    }
    if let Some(p) = plateau {
        request = request.early_stop_plateau(p);
    }
    if let Some(s) = seed {
        request = request.seed(s);
    }
    if let Some(wf) = walk_forward {
        request = request.walk_forward(wf);
    }
    Ok(AppCommand::Submit(Box::new(request)))
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("{} must be a number, got {}", key, value))
}

/// `N@LEN`: N folds over a timeline of LEN points.
fn parse_folds(value: &str) -> Result<WalkForwardConfig, String> {
    let (folds, len) = value
        .split_once('@')
        .ok_or_else(|| format!("folds must look like N@LEN, got {}", value))?;
    let folds: usize = parse_num("folds", folds)?;
    let total_length: usize = parse_num("folds", len)?;
    Ok(WalkForwardConfig::new(total_length, folds))
}

/// `a,b,c` is a value list, `min..max` a range. Ranges with integer bounds
/// sample integers.
fn parse_param(value: &str) -> ParamSpec {
    if let Some(caps) = range_re().captures(value) {
        let (lo, hi) = (&caps[1], &caps[2]);
        if let (Ok(min), Ok(max)) = (lo.parse::<f64>(), hi.parse::<f64>()) {
            let integer = !lo.contains('.') && !hi.contains('.');
            return ParamSpec::Bounds(ParamRange { min, max, integer });
        }
    }
    ParamSpec::Values(value.split(',').map(scalar).collect())
}

fn scalar(raw: &str) -> Value {
    let raw = raw.trim();
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}

fn parse_interval_seconds(s: &str) -> Option<u64> {
    let raw = s.trim();
    if raw.is_empty() {
        return None;
    }
    let t = raw.to_ascii_lowercase();
    if let Ok(v) = t.parse::<u64>() {
        return Some(v);
    }

    let parse_num = |x: &str| x.trim().parse::<u64>().ok();

    for (suffix, mul) in [
        ("s", 1u64),
        ("m", 60u64),
        ("h", 3600u64),
        ("d", 86400u64),
    ] {
        if let Some(prefix) = t.strip_suffix(suffix) {
            if let Some(v) = parse_num(prefix) {
                return v.checked_mul(mul);
            }
        }
    }

    None
}
