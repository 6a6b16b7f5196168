use anyhow::Result;
use clap::{Parser, Subcommand};
use kiln_schemas::Order;

mod commands;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Kiln order reconciliation CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> overrides)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Local order registry
    Order {
        #[command(subcommand)]
        cmd: OrderCmd,
    },

    /// Reconcile one order against upstream and print the result as JSON
    Reconcile {
        #[arg(long)]
        order_id: String,

        /// Layered config paths in merge order
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        /// Single attempt; ignore the /retry section
        #[arg(long, default_value_t = false)]
        no_retry: bool,
    },

    /// Reconcile every order that has an upstream reference
    ReconcileAll {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,
    },

    /// Print the tracking state (suffixes, mappings, local items) of an order
    Tracking {
        #[arg(long)]
        order_id: String,
    },

    /// Print recent reconcile runs of an order
    Runs {
        #[arg(long)]
        order_id: String,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,

    /// Apply SQL migrations.
    Migrate,
}

#[derive(Subcommand)]
enum OrderCmd {
    /// Register an order (or update its upstream reference).
    Register {
        #[arg(long)]
        order_id: String,

        /// Fixed once registered; seeds every serial number of the order.
        #[arg(long)]
        order_number: String,

        #[arg(long)]
        upstream_order_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = kiln_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = kiln_db::status(&pool).await?;
                    println!(
                        "db_ok={} has_item_mappings_table={}",
                        s.ok, s.has_item_mappings_table
                    );
                }
                DbCmd::Migrate => {
                    kiln_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let loaded = commands::load_config(&paths)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Order { cmd } => match cmd {
            OrderCmd::Register {
                order_id,
                order_number,
                upstream_order_id,
            } => {
                let pool = kiln_db::connect_from_env().await?;
                let order = Order::new(order_id, order_number, upstream_order_id);
                commands::validate_order(&order)?;
                kiln_db::upsert_order(&pool, &order).await?;
                println!(
                    "registered=true order_id={} order_number={}",
                    order.order_id, order.order_number
                );
            }
        },

        Commands::Reconcile {
            order_id,
            config_paths,
            no_retry,
        } => commands::reconcile::run_one(&order_id, &config_paths, no_retry).await?,

        Commands::ReconcileAll { config_paths } => {
            commands::reconcile::run_all(&config_paths).await?
        }

        Commands::Tracking { order_id } => commands::reconcile::tracking(&order_id).await?,

        Commands::Runs { order_id, limit } => {
            let pool = kiln_db::connect_from_env().await?;
            let runs = kiln_db::recent_runs(&pool, &order_id, limit).await?;
            println!("{}", serde_json::to_string_pretty(&runs)?);
        }
    }

    Ok(())
}
