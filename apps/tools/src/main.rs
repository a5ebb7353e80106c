use anyhow::Result;
use clap::{Parser, Subcommand};
use kanban_api::ApiContext;
use shared::{
    domain::{AccountId, ActorRole, KanbanId, ProductCode, StatusChainId, StatusId},
    protocol::{
        AccountInput, NewKanbanChain, NewStatusChain, ProductInput, StatusChainEntryInput,
        StatusInput,
    },
};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://kanban.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateAccount {
        name: String,
        #[arg(long, default_value = "")]
        vat_number: String,
        #[arg(long, default_value = "")]
        address: String,
    },
    CreateProduct {
        product_code: String,
        name: String,
    },
    CreateStatus {
        name: String,
        color: String,
    },
    CreateStatusChain {
        name: String,
        /// `<status_id>:<order>:<supplier|customer>`, repeatable.
        #[arg(long = "entry", value_parser = parse_entry)]
        entries: Vec<StatusChainEntryInput>,
    },
    CreateKanbanChain {
        #[arg(long)]
        customer_account_id: i64,
        #[arg(long)]
        supplier_account_id: i64,
        #[arg(long)]
        product_code: String,
        #[arg(long)]
        status_chain_id: i64,
        #[arg(long)]
        leadtime_days: i64,
        #[arg(long)]
        quantity: f64,
        #[arg(long, default_value = "bin")]
        container_type: String,
        #[arg(long, default_value_t = 1)]
        target_active_kanban_count: i64,
        #[arg(long)]
        initial_kanbans: Option<u32>,
    },
    Advance {
        kanban_id: i64,
    },
    History {
        kanban_id: i64,
    },
}

fn parse_entry(raw: &str) -> Result<StatusChainEntryInput, String> {
    let parts: Vec<&str> = raw.split(':').collect();
    let [status_id, order, role] = parts.as_slice() else {
        return Err(format!("expected <status_id>:<order>:<role>, got '{raw}'"));
    };
    let status_id = status_id
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("invalid status id '{status_id}': {e}"))?;
    let order = order
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("invalid order '{order}': {e}"))?;
    let actor_role = role.parse::<ActorRole>()?;
    Ok(StatusChainEntryInput {
        status_id: StatusId(status_id),
        order,
        actor_role,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = ApiContext::new(Storage::new(&cli.database_url).await?);

    match cli.command {
        Command::CreateAccount {
            name,
            vat_number,
            address,
        } => {
            let account = kanban_api::create_account(
                &ctx,
                &AccountInput {
                    name,
                    vat_number,
                    address,
                },
            )
            .await?;
            println!("created account_id={}", account.id);
        }
        Command::CreateProduct { product_code, name } => {
            let product = kanban_api::create_product(
                &ctx,
                &ProductInput {
                    product_code: ProductCode(product_code),
                    name,
                },
            )
            .await?;
            println!("created product_code={}", product.product_code);
        }
        Command::CreateStatus { name, color } => {
            let status = kanban_api::create_status(&ctx, &StatusInput { name, color }).await?;
            println!("created status_id={}", status.id);
        }
        Command::CreateStatusChain { name, entries } => {
            let detail =
                kanban_api::create_status_chain(&ctx, &NewStatusChain { name, entries }).await?;
            println!(
                "created status_chain_id={} entries={}",
                detail.status_chain.id,
                detail.entries.len()
            );
        }
        Command::CreateKanbanChain {
            customer_account_id,
            supplier_account_id,
            product_code,
            status_chain_id,
            leadtime_days,
            quantity,
            container_type,
            target_active_kanban_count,
            initial_kanbans,
        } => {
            let created = kanban_api::create_kanban_chain(
                &ctx,
                &NewKanbanChain {
                    customer_account_id: AccountId(customer_account_id),
                    product_code: ProductCode(product_code),
                    supplier_account_id: AccountId(supplier_account_id),
                    leadtime_days,
                    quantity,
                    container_type,
                    status_chain_id: StatusChainId(status_chain_id),
                    target_active_kanban_count,
                },
                initial_kanbans,
            )
            .await?;
            println!(
                "created kanban_chain_id={} kanbans={}",
                created.kanban_chain.id,
                created.kanbans.len()
            );
        }
        Command::Advance { kanban_id } => {
            let kanban = kanban_api::advance_kanban(&ctx, KanbanId(kanban_id)).await?;
            println!(
                "kanban_id={} status_current={} revision={}",
                kanban.id, kanban.status_current, kanban.status_revision
            );
        }
        Command::History { kanban_id } => {
            for row in kanban_api::kanban_history(&ctx, KanbanId(kanban_id)).await? {
                println!(
                    "{} {} -> {}",
                    row.recorded_at.to_rfc3339(),
                    row.previous_status,
                    row.next_status
                );
            }
        }
    }

    Ok(())
}
