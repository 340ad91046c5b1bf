use clap::Parser;
use std::path::PathBuf;

/// A high-performance yEnc poster for Usenet
#[derive(Parser, Debug)]
#[command(name = "ul-nzb")]
#[command(version, about, long_about = None)]
#[command(after_help = "EXAMPLES:
    # Post a single file to one group
    ul-nzb big.iso -g alt.binaries.test

    # Post a directory under a common subject, writing an NZB
    ul-nzb ./release -s \"my release\" -g alt.binaries.test -o release.nzb

    # Post to several groups with a custom article size
    ul-nzb big.iso -g alt.binaries.test -g alt.binaries.misc -a 500000

    # Verify every article after posting, reposting what is missing
    ul-nzb big.iso -g alt.binaries.test -v")]
pub struct Cli {
    /// Files or directories to post (directories are walked recursively)
    #[arg(value_name = "PATH", required = true)]
    pub files: Vec<PathBuf>,

    /// Subject of the post; defaults to the input's name for a single input
    #[arg(short = 's', long)]
    pub subject: Option<String>,

    /// Size in bytes of each article (overrides the config file)
    #[arg(short = 'a', long = "articlesize", value_name = "BYTES")]
    pub article_size: Option<usize>,

    /// Validate articles after posting: STAT each one and repost if bad
    #[arg(short = 'v', long)]
    pub validate: bool,

    /// Raw post mode; emulates GoPostStuff, newsmangler, etc.
    #[arg(
        short = 'r',
        long,
        value_name = "BOOL",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub raw: bool,

    /// Configuration file path (default: ~/.ul-nzb.conf)
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Output NZB file, or a directory to place <subject>.nzb in
    #[arg(short = 'o', long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Newsgroup to post to (repeat for a crosspost)
    #[arg(short = 'g', long = "group", value_name = "GROUP")]
    pub groups: Vec<String>,

    /// Number of IO threads to use. 1 IO thread is usually fine.
    #[arg(long, hide = true, default_value_t = 1, value_name = "NUM")]
    pub iothreads: usize,
}
