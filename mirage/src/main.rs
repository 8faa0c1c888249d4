use mirage_config::MirageConfig;
use utils::init_tracing;

mod master;
mod upstream;
mod worker;

use master::Master;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = MirageConfig::from_file_or_default("mirage.conf");
    init_tracing(&format!("{},mirage=debug", cfg.global().log_level()));
    cfg.print();

    let master = Master::build(cfg).await?;
    master.run().await
}
