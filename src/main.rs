use std::io::{self, Write};
use std::process;

use check_by_powershell::cli::Cli;
use check_by_powershell::{logging, plugin};
use tracing::debug;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    plugin::install_panic_hook();

    let cli = Cli::parse_or_exit();
    logging::init(cli.debug);

    let mut config = cli.to_config();
    if let Err(err) = config.validate() {
        plugin::exit_unknown(err);
    }

    let outcome = config.run(cli.timeout()).await;
    let (text, code) = plugin::render(&outcome, cli.debug);
    debug!(
        exit_code = code,
        status = ?plugin::Status::from_code(code),
        "check finished"
    );

    let mut stdout = io::stdout().lock();
    let _ = stdout.write_all(text.as_bytes());
    let _ = stdout.flush();

    // a timed out SSH dial may still occupy the blocking pool
    process::exit(code);
}
