use argh::FromArgs;

use crate::conf::{DatasourceId, GatewayConf};
use crate::errors::ApiError;
use crate::gateway::Gateway;

#[derive(FromArgs, PartialEq, Eq, Debug, Clone)]
/// Metadata-driven REST and GraphQL gateway
pub struct GatewayCommand {
    #[argh(subcommand)]
    pub nested: NestedCommand,

    #[argh(switch, short = 'v', long = "verbose")]
    /// enable verbose output
    pub verbose: bool,
}

#[derive(FromArgs, PartialEq, Eq, Debug, Clone)]
#[argh(subcommand)]
pub enum NestedCommand {
    Serve(ServeCommand),
    Scan(ScanCommand),
}

#[derive(FromArgs, PartialEq, Eq, Debug, Clone)]
#[argh(subcommand, name = "serve")]
/// Serve the gateway
pub struct ServeCommand {
    #[argh(option)]
    /// host to bind the server to (overrides HOST)
    host: Option<String>,

    #[argh(option)]
    /// port to bind the server to (overrides PORT)
    port: Option<u16>,
}

#[derive(FromArgs, PartialEq, Eq, Debug, Clone)]
#[argh(subcommand, name = "scan")]
/// List the tables of a datasource with their selection flags
pub struct ScanCommand {
    #[argh(option, default = "1")]
    /// datasource id
    datasource: DatasourceId,
}

impl GatewayCommand {
    pub async fn run(self, mut conf: GatewayConf) -> Result<(), ApiError> {
        match self.nested {
            NestedCommand::Serve(serve) => {
                if let Some(host) = serve.host {
                    conf.host = host;
                }
                if let Some(port) = serve.port {
                    conf.port = port;
                }
                if self.verbose {
                    println!("Serving on {}:{}", conf.host, conf.port);
                }
                Gateway::builder(conf).build().await?.serve().await
            }
            NestedCommand::Scan(scan) => {
                let gateway = Gateway::builder(conf).build().await?;
                let report = gateway.orchestrator().selections().scan(scan.datasource).await?;
                for t in &report.tables {
                    println!(
                        "{:<40} selected={:<5} generated={:<5} conflict={}",
                        t.name, t.selected, t.generated, t.conflict
                    );
                }
                println!(
                    "{} tables, {} selected, {} generated, {} in conflict",
                    report.total, report.selected, report.generated, report.conflict
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands() {
        let cmd = GatewayCommand::from_args(&["autoapi"], &["scan", "--datasource", "2"]).unwrap();
        assert_eq!(cmd.nested, NestedCommand::Scan(ScanCommand { datasource: 2 }));

        let cmd = GatewayCommand::from_args(&["autoapi"], &["-v", "serve", "--port", "9000"]).unwrap();
        assert!(cmd.verbose);
        assert_eq!(
            cmd.nested,
            NestedCommand::Serve(ServeCommand {
                host: None,
                port: Some(9000)
            })
        );
    }
}
