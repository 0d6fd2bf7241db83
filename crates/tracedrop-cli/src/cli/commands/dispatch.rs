use super::super::args::*;
use tracedrop_core::SystemRunner;

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let runner = SystemRunner::new().echo_commands(cli.echo_commands);
    match cli.cmd {
        Command::Keygen(args) => super::keygen::run(args),
        Command::Upload(args) => super::upload::run(args, &runner).await,
        Command::UploadPackage(args) => super::upload_package::run(args, &runner).await,
    }
}
