use std::env;

use sqlx::PgPool;
use transactional_outbox::{OutboxStore, SqlxOutboxStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage:");
        eprintln!("  outbox-cli pending <DATABASE_URL>");
        eprintln!("  outbox-cli requeue-dead-letters <tenant_id> <DATABASE_URL>");
        std::process::exit(1);
    }

    let cmd = args[1].as_str();

    match cmd {
        "pending" if args.len() == 3 => {
            let pool = PgPool::connect(&args[2]).await?;
            let store = SqlxOutboxStore::new(pool);
            let (pending, age) = store.pending_stats().await?;
            println!("{} pending rows, oldest {}s", pending, age);
        }
        "requeue-dead-letters" if args.len() == 4 => {
            let tenant_id = &args[2];
            let pool = PgPool::connect(&args[3]).await?;
            let store = SqlxOutboxStore::new(pool);
            let count = store.requeue_dead_letters(tenant_id).await?;
            println!("Requeued {} dead-lettered rows for tenant {}", count, tenant_id);
        }
        _ => {
            eprintln!("Invalid arguments");
            std::process::exit(1);
        }
    }

    Ok(())
}
