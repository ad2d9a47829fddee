use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;
use wlfat::builder::MAX_SOURCE_PATHS;

#[derive(Parser, Debug)]
#[command(
    name = "wlfat",
    about = "Create and load a FATFS disk image",
    long_about = "Create a wear-levelled FAT flash image of the given size and copy files and directories into its root"
)]
pub struct Args {
    /// Output image file
    #[arg(value_name = "IMAGE")]
    pub image: PathBuf,

    /// Image size in KB
    #[arg(value_name = "KB")]
    pub size_kb: usize,

    /// Files or directories to copy into the image
    #[arg(value_name = "PATHS", required = true, num_args = 1..=MAX_SOURCE_PATHS)]
    pub paths: Vec<PathBuf>,

    /// Log level (0=none, 1=error, 2=warn, 3=info, 4=debug, 5=verbose)
    #[arg(
        short = 'l',
        long = "log",
        value_name = "LEVEL",
        default_value_t = 3,
        allow_negative_numbers = true
    )]
    pub log: i64,

    /// Exit with an error if any entry could not be copied
    #[arg(long = "strict")]
    pub strict: bool,
}

impl Args {
    /// Level for this crate's records, and whether other crates are shown.
    pub fn log_filter(&self) -> (LevelFilter, bool) {
        match self.log.clamp(0, 5) {
            0 => (LevelFilter::Off, false),
            1 => (LevelFilter::Error, false),
            2 => (LevelFilter::Warn, false),
            3 => (LevelFilter::Info, false),
            4 => (LevelFilter::Debug, false),
            _ => (LevelFilter::Trace, true),
        }
    }
}
