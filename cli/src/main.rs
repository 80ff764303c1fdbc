//! Thin metainfo tooling around the engine's `bittorrent` crate: create a
//! new `.torrent`, edit an existing one's tracker list, or print a summary.
//! `remote` is a stub: talking to a running daemon is an RPC control
//! surface this repository doesn't implement.

use std::path::PathBuf;
use clap::{Parser, Subcommand};
use anyhow::{bail, Context, Result};
use bittorrent::{MetaInfo, MetaInfoBuilder};

#[derive(Parser)]
#[command(name = "bitrider", about = "BitTorrent metainfo tooling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a .torrent from a file or directory.
    Create {
        /// File or directory to create a torrent from.
        input: Option<PathBuf>,

        #[arg(short = 'p', long)]
        private: bool,

        #[arg(short = 'r', long, value_name = "source")]
        source: Option<String>,

        #[arg(short = 'o', long, value_name = "file")]
        outfile: Option<PathBuf>,

        #[arg(short = 's', long = "piecesize", value_name = "KiB")]
        piece_size: Option<u32>,

        #[arg(short = 'c', long)]
        comment: Option<String>,

        #[arg(short = 't', long = "tracker", value_name = "url")]
        tracker: Vec<String>,

        #[arg(short = 'w', long = "webseed", value_name = "url")]
        webseed: Vec<String>,

        /// Omit "creation date" and "created by" from the manifest.
        #[arg(short = 'x', long)]
        anonymize: bool,

        #[arg(short = 'V', long)]
        version: bool,
    },

    /// Add, remove, or substring-replace trackers on an existing .torrent.
    Edit {
        torrent: PathBuf,

        #[arg(short = 'a', long = "add", value_name = "url")]
        add: Vec<String>,

        #[arg(short = 'd', long = "delete", value_name = "url")]
        delete: Vec<String>,

        #[arg(short = 'r', long = "replace", num_args = 2, value_names = ["old", "new"])]
        replace: Vec<String>,
    },

    /// Print a manifest summary.
    Show {
        torrent: PathBuf,
    },

    /// Talk to a running daemon over its RPC interface.
    Remote {
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Create { input, private, source, outfile, piece_size, comment, tracker, webseed, anonymize, version } =>
            create(input, private, source, outfile, piece_size, comment, tracker, webseed, anonymize, version),
        Command::Edit { torrent, add, delete, replace } => edit(torrent, add, delete, replace),
        Command::Show { torrent } => show(torrent),
        Command::Remote { args } => remote(args),
    };

    if let Err(e) = &result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn create(
    input: Option<PathBuf>,
    private: bool,
    source: Option<String>,
    outfile: Option<PathBuf>,
    piece_size_kib: Option<u32>,
    comment: Option<String>,
    trackers: Vec<String>,
    webseeds: Vec<String>,
    anonymize: bool,
    version: bool,
) -> Result<()> {
    if version {
        println!("bitrider create {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    let input = input.context("no input file or directory specified")?;

    let mut builder = MetaInfoBuilder::new(&input)
        .with_context(|| format!("reading {}", input.display()))?;

    if let Some(kib) = piece_size_kib {
        builder.set_piece_size(kib * 1024)?;
    }
    builder.set_private(private);
    builder.set_anonymize(anonymize);
    if let Some(source) = source {
        builder.set_source(source);
    }
    if let Some(comment) = comment {
        builder.set_comment(comment);
    }
    builder.set_webseeds(webseeds);

    for (tier, url) in trackers.iter().enumerate() {
        let url = url::Url::parse(url).with_context(|| format!("invalid tracker url {url:?}"))?;
        builder.add_tracker(tier, url);
    }
    if trackers.is_empty() && !private {
        eprintln!("WARNING: no trackers specified");
    }

    println!("{} file(s), {} bytes", builder.file_count(), builder.total_size());
    println!("{} piece(s), {} bytes each", builder.piece_count(), builder.piece_size());

    let outfile = outfile.unwrap_or_else(|| {
        let base = input.file_name().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("out"));
        base.with_extension("torrent")
    });

    let metainfo = builder.build()?;
    MetaInfoBuilder::save(&metainfo, &outfile)?;
    println!("wrote {}", outfile.display());
    Ok(())
}

fn edit(torrent: PathBuf, add: Vec<String>, delete: Vec<String>, replace: Vec<String>) -> Result<()> {
    let raw = std::fs::read(&torrent).with_context(|| format!("reading {}", torrent.display()))?;
    let mut metainfo = MetaInfo::parse(&raw)?;

    for url in &add {
        let url = url::Url::parse(url).with_context(|| format!("invalid tracker url {url:?}"))?;
        metainfo.add_tracker(usize::MAX, url);
    }
    for url in &delete {
        let url = url::Url::parse(url).with_context(|| format!("invalid tracker url {url:?}"))?;
        metainfo.remove_tracker(&url);
    }
    for pair in replace.chunks(2) {
        if let [old, new] = pair {
            metainfo.replace_tracker_substring(old, new);
        }
    }

    metainfo.save(&torrent)?;
    println!("updated {}", torrent.display());
    Ok(())
}

fn show(torrent: PathBuf) -> Result<()> {
    let raw = std::fs::read(&torrent).with_context(|| format!("reading {}", torrent.display()))?;
    let metainfo = MetaInfo::parse(&raw)?;

    println!("name:      {}", metainfo.name());
    println!("info hash: {}", metainfo.info_hash_hex());
    println!("size:      {}", metainfo.size_fmt());
    println!("pieces:    {} x {} bytes", metainfo.num_pieces(), metainfo.piece_len());
    println!("private:   {}", metainfo.is_private());
    if let Some(created) = metainfo.creation_date_fmt() {
        println!("created:   {created}");
    }
    if let Some(comment) = &metainfo.comment {
        println!("comment:   {comment}");
    }
    if let Some(created_by) = &metainfo.created_by {
        println!("client:    {created_by}");
    }

    println!("trackers:");
    for (tier_idx, tier) in metainfo.tracker_tiers().iter().enumerate() {
        for url in tier {
            println!("  [{tier_idx}] {url}");
        }
    }

    if metainfo.is_multi_file() {
        println!("files:");
        for file in metainfo.files() {
            println!("  {} ({} bytes)", file.path.display(), file.length);
        }
    }

    Ok(())
}

fn remote(_args: Vec<String>) -> Result<()> {
    bail!("not implemented: requires a running daemon")
}
