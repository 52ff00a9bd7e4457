use clap::Parser;
use cluster_gateway::cli::Command;
use gateway_telemetry::Tracing;
use snafu::{ResultExt, Snafu};

const SERVICE_NAME: &str = "cluster-gateway";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize tracing"))]
    InitTracing { source: gateway_telemetry::tracing::Error },

    #[snafu(display("failed to run the cluster gateway"))]
    Run { source: cluster_gateway::Error },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let Command::Run(mut arguments) = Command::parse();

    // Exporters are shut down once the guard is dropped
    let _tracing_guard =
        Tracing::new(SERVICE_NAME, std::mem::take(&mut arguments.telemetry))
            .init()
            .context(InitTracingSnafu)?;

    cluster_gateway::run(arguments).await.context(RunSnafu)
}
