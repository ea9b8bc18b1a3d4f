//! `oms-admin`: a read-only operational CLI for inspecting engine state
//! in Redis without going through the provider/AMQP wiring.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use oms_bins::common::{init_logging, redis_url, CommonArgs};
use oms_core::config::Config;
use oms_core::core::UserType;
use oms_core::redis_store::{keys, order_codec, RedisStore};
use serde_json::json;

#[derive(Parser)]
#[command(name = "oms-admin", author, version, about)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a user's cached portfolio hash (`user_portfolio:{...}`).
    Portfolio {
        #[arg(value_enum)]
        user_type: CliUserType,
        user_id: String,
    },
    /// Print one order's canonical record (`order_data:{order_id}`).
    Order { order_id: String },
    /// List order ids queued in a pending-order index.
    Pending { symbol: String, order_type: String },
    /// List order ids queued in the stop-loss/take-profit index for one side.
    Trigger {
        symbol: String,
        side: String,
        #[arg(long, default_value = "sl")]
        kind: String,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliUserType {
    Live,
    Demo,
    StrategyProvider,
    CopyFollower,
}

impl From<CliUserType> for UserType {
    fn from(v: CliUserType) -> Self {
        match v {
            CliUserType::Live => UserType::Live,
            CliUserType::Demo => UserType::Demo,
            CliUserType::StrategyProvider => UserType::StrategyProvider,
            CliUserType::CopyFollower => UserType::CopyFollower,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(&args.common.log_level, args.common.json_logs)?;

    let config = Config::load(args.common.profile.as_deref()).context("loading configuration")?;
    let redis = RedisStore::connect(&redis_url(&config.redis)?)
        .await
        .context("connecting to redis")?;

    match args.command {
        Command::Portfolio { user_type, user_id } => {
            let user_type: UserType = user_type.into();
            let fields = redis
                .hgetall(&keys::user_portfolio(user_type, &user_id))
                .await
                .context("reading user_portfolio hash")?;
            if fields.is_empty() {
                println!("no cached portfolio for {user_type}:{user_id}");
            } else {
                println!("{}", serde_json::to_string_pretty(&json!(fields))?);
            }
        }
        Command::Order { order_id } => {
            let fields = redis
                .hgetall(&keys::order_data(&order_id))
                .await
                .context("reading order_data hash")?;
            if fields.is_empty() {
                println!("no order record for {order_id}");
                return Ok(());
            }
            let order = order_codec::from_hash(&fields).context("decoding order_data")?;
            println!("{}", serde_json::to_string_pretty(&order)?);
        }
        Command::Pending { symbol, order_type } => {
            let members = redis
                .zrange_all(&keys::pending_index(&symbol, &order_type))
                .await
                .context("reading pending_index")?;
            print_member_list(&members);
        }
        Command::Trigger { symbol, side, kind } => {
            let key = match kind.as_str() {
                "tp" => keys::tp_index(&symbol, &side),
                _ => keys::sl_index(&symbol, &side),
            };
            let members = redis.zrange_all(&key).await.context("reading trigger index")?;
            print_member_list(&members);
        }
    }

    Ok(())
}

fn print_member_list(members: &[String]) {
    if members.is_empty() {
        println!("(empty)");
        return;
    }
    for m in members {
        println!("{m}");
    }
}
