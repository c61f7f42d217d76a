//! atomd CLI entry point.

use atomd_lib::cli::{self, Cli};
use atomd_lib::core::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    cli::execute(cli).await
}
