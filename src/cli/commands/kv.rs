//! Key-value command implementations.

use crate::client::{Client, Format, OpOptions, OpResult, Value};
use anyhow::Result;
use clap::{Args, ValueEnum};

/// Read a key.
#[derive(Args, Debug)]
pub struct GetArgs {
    /// Key to read.
    pub key: String,
    /// Decode the value as this format instead of the stored flags.
    #[arg(long)]
    pub format: Option<Format>,
    /// Lock the item for this many seconds.
    #[arg(long, conflicts_with = "touch")]
    pub lock: Option<u32>,
    /// Also reset the expiry (seconds).
    #[arg(long)]
    pub touch: Option<u32>,
}

/// Store mode.
#[derive(ValueEnum, Debug, Clone, Copy, Default)]
pub enum StoreMode {
    #[default]
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

/// Store a key.
#[derive(Args, Debug)]
pub struct SetArgs {
    pub key: String,
    pub value: String,
    #[arg(long, value_enum, default_value_t = StoreMode::Set)]
    pub store: StoreMode,
    /// Value format (json, utf8, auto).
    #[arg(long)]
    pub format: Option<Format>,
    /// Expiry in seconds.
    #[arg(long)]
    pub expiry: Option<u32>,
    /// Only store over this cas.
    #[arg(long)]
    pub cas: Option<u64>,
}

/// Remove a key.
#[derive(Args, Debug)]
pub struct RemoveArgs {
    pub key: String,
    #[arg(long)]
    pub cas: Option<u64>,
}

/// Adjust a counter.
#[derive(Args, Debug)]
pub struct CounterArgs {
    pub key: String,
    #[arg(long, default_value_t = 1)]
    pub delta: u64,
    /// Create the counter with this value if missing.
    #[arg(long)]
    pub initial: Option<u64>,
    /// Expiry in seconds when the counter is created.
    #[arg(long)]
    pub expiry: Option<u32>,
}

fn print_result(result: &OpResult) {
    match &result.value {
        Some(value) => println!("{}", value),
        None => println!("ok"),
    }
    if let Some(cas) = result.cas {
        eprintln!("cas: {}", cas.0);
    }
}

pub async fn run_get(client: &Client, args: GetArgs) -> Result<()> {
    let mut options = OpOptions::new();
    if let Some(format) = args.format {
        options = options.with_format(format);
    }
    if let Some(expiry) = args.touch {
        options = options.with_expiry(expiry);
    }
    let result = match args.lock {
        Some(seconds) => {
            client
                .get_and_lock(&args.key, options.with_lock_time(seconds))
                .await?
        }
        None => client.get(&args.key, options).await?,
    };
    print_result(&result);
    Ok(())
}

pub async fn run_set(client: &Client, args: SetArgs) -> Result<()> {
    let mut options = OpOptions::new();
    if let Some(format) = args.format {
        options = options.with_format(format);
    }
    if let Some(expiry) = args.expiry {
        options = options.with_expiry(expiry);
    }
    if let Some(cas) = args.cas {
        options = options.with_cas(cas);
    }
    let value: Value = match args.format {
        Some(Format::Json) => serde_json::from_str(&args.value)
            .map(Value::Json)
            .unwrap_or_else(|_| args.value.clone().into()),
        Some(Format::Raw) => Value::Raw(args.value.clone().into_bytes().into()),
        _ => args.value.clone().into(),
    };

    let key = args.key.as_str();
    let result = match args.store {
        StoreMode::Set => client.set(key, value, options).await?,
        StoreMode::Add => client.add(key, value, options).await?,
        StoreMode::Replace => client.replace(key, value, options).await?,
        StoreMode::Append => client.append(key, value, options).await?,
        StoreMode::Prepend => client.prepend(key, value, options).await?,
    };
    print_result(&result);
    Ok(())
}

pub async fn run_remove(client: &Client, args: RemoveArgs) -> Result<()> {
    let mut options = OpOptions::new();
    if let Some(cas) = args.cas {
        options = options.with_cas(cas);
    }
    let result = client.remove(&args.key, options).await?;
    print_result(&result);
    Ok(())
}

pub async fn run_counter(client: &Client, args: CounterArgs, decrement: bool) -> Result<()> {
    let mut options = OpOptions::new().with_offset(args.delta);
    if let Some(initial) = args.initial {
        options = options.with_initial(initial);
    }
    if let Some(expiry) = args.expiry {
        options = options.with_expiry(expiry);
    }
    let result = if decrement {
        client.decr(&args.key, options).await?
    } else {
        client.incr(&args.key, options).await?
    };
    print_result(&result);
    Ok(())
}
