use anyhow::Result;
use clap::Parser;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use custos::config::Profile;
use custos::error::Error;
use custos::{append, list, mounts, pipeline};

const USAGE: &str = "usage: custos -i source dest.sfs
       custos -a file... dest.sfs
       custos -l container.sfs...
       custos -m [container.sfs...]
       custos -u mountpoint...";

#[derive(Parser)]
#[command(name = "custos")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Forensic evidence containers: acquire, append, list, mount")]
struct Cli {
    /// Acquire a source (device, file, or - for stdin) into a new container
    #[arg(short = 'i', group = "mode")]
    image: bool,

    /// Append files to an existing container
    #[arg(short = 'a', group = "mode")]
    append: bool,

    /// List container contents
    #[arg(short = 'l', group = "mode")]
    list: bool,

    /// Mount containers, or list active mounts when no target is given
    #[arg(short = 'm', group = "mode")]
    mount: bool,

    /// Unmount container mount points
    #[arg(short = 'u', group = "mode")]
    unmount: bool,

    /// Verbose tracing output
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Targets for the selected mode
    args: Vec<String>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.kind() == clap::error::ErrorKind::DisplayHelp
            || e.kind() == clap::error::ErrorKind::DisplayVersion =>
        {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };

    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", style("error:").red().bold());
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "custos=debug" } else { "custos=warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let profile = Profile::load()?;

    if cli.image {
        let [source, dest] = cli.args.as_slice() else {
            return Err(usage("-i takes exactly a source and a destination"));
        };
        run_create(source, Path::new(dest), &profile)?;
    } else if cli.append {
        let Some((dest, files)) = cli.args.split_last().filter(|(_, f)| !f.is_empty()) else {
            return Err(usage("-a takes at least one file and a destination"));
        };
        let files: Vec<PathBuf> = files.iter().map(PathBuf::from).collect();
        append::append(&files, Path::new(dest), &profile)?;
    } else if cli.list {
        if cli.args.is_empty() {
            return Err(usage("-l takes at least one container"));
        }
        let containers: Vec<PathBuf> = cli.args.iter().map(PathBuf::from).collect();
        list::list_all(&containers, &profile)?;
    } else if cli.mount {
        if cli.args.is_empty() {
            print_mount_table()?;
        } else {
            let containers: Vec<PathBuf> = cli.args.iter().map(PathBuf::from).collect();
            mounts::mount_all(&containers, &profile)?;
        }
    } else if cli.unmount {
        if cli.args.is_empty() {
            return Err(usage("-u takes at least one mount point"));
        }
        mounts::unmount_all(&cli.args, &profile)?;
    } else {
        return Err(usage("one of -i, -a, -l, -m, -u is required"));
    }
    Ok(())
}

fn usage(msg: &str) -> anyhow::Error {
    eprintln!("{USAGE}");
    Error::Usage(msg.to_string()).into()
}

fn print_mount_table() -> Result<()> {
    let entries = mounts::list_mounted()?;
    if entries.is_empty() {
        println!("no evidence containers mounted");
        return Ok(());
    }
    for entry in &entries {
        println!("{} on {}", entry.device, entry.target.display());
    }
    Ok(())
}

fn run_create(source_arg: &str, dest: &Path, profile: &Profile) -> Result<()> {
    let invocation = std::env::args().collect::<Vec<_>>().join(" ");

    let (source, total) = pipeline::preflight(source_arg, dest, profile)?;
    let pb = match total {
        Some(total) => {
            let pb = ProgressBar::new(total);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")?
                    .progress_chars("=>-"),
            );
            pb
        }
        None => {
            let pb = ProgressBar::new_spinner();
            pb.set_style(ProgressStyle::default_spinner().template("{spinner} {bytes} {msg}")?);
            pb
        }
    };
    pb.set_message("acquiring");

    let progress = |copied: u64| pb.set_position(copied);
    let acq = pipeline::create_container(source_arg, dest, profile, &invocation, Some(&progress))?;

    pb.finish_with_message("acquisition complete");
    println!();
    println!("{}", style("Container sealed").green().bold());
    println!("Source:      {}", source.id());
    println!("Destination: {}", dest.display());
    println!("Bytes:       {}", acq.bytes_copied);
    println!("{}:         {}", profile.hash.label(), acq.digest);
    Ok(())
}
