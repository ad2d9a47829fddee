mod cli;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use cli::Args;
use wlfat::builder::{self, BuildOptions};

fn main() -> Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => match err.kind() {
            // Asking for usage is not a successful build.
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                let _ = err.print();
                std::process::exit(1);
            }
            _ => err.exit(),
        },
    };

    let (level, all_crates) = args.log_filter();
    let mut logger = env_logger::Builder::new();
    if all_crates {
        logger.filter_level(level);
    } else {
        logger
            .filter_level(log::LevelFilter::Off)
            .filter_module("wlfat", level);
    }
    logger.format_timestamp(None).format_target(false).init();

    let options = BuildOptions::new(args.image.clone(), args.size_kb, args.paths.clone());
    let report = builder::build(&options)
        .map_err(|err| {
            let stage = err.stage();
            anyhow::Error::new(err).context(format!("build stopped before stage '{stage}'"))
        })
        .with_context(|| format!("Unable to create image '{}'", args.image.display()))?;

    println!("{report}");

    if args.strict && !report.failures.is_empty() {
        anyhow::bail!(
            "{} entries could not be copied into '{}'",
            report.failures.len(),
            args.image.display()
        );
    }

    Ok(())
}
