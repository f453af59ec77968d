//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Command-line device for the DAQ-Link slow-control network."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::Result;
use clap::{ArgAction, Args};
use daqlink_core::DaqInterface;

#[derive(Debug, Args)]
pub struct QueryArgs {
    pub query: String,
    /// Database to run against. Defaults to the configured one.
    #[arg(long, short = 'd')]
    pub database: Option<String>,
    /// Print every row instead of only the first.
    #[arg(long, action = ArgAction::SetTrue)]
    pub all: bool,
}

pub fn run(interface: &DaqInterface, args: QueryArgs) -> Result<()> {
    if args.all {
        for row in interface.sql_query_rows(args.database.as_deref(), &args.query, None)? {
            println!("{row}");
        }
    } else {
        let row = interface.sql_query(args.database.as_deref(), &args.query, None)?;
        if !row.is_empty() {
            println!("{row}");
        }
    }
    Ok(())
}
