use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use shardfs::client::CoordinatorClient;
use shardfs::command::Command;
use shardfs::error::WithPath;
use shardfs::path::LogicalPath;
use std::fs;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

/// Client of the shardfs sharded file store.
///
/// Files are uploaded to and requested from the coordinator, which keeps `.c` files itself and
/// places `.pdf`, `.txt` and `.zip` files on the storage nodes S2, S3 and S4. Paths in the store
/// always start with `~S1`, regardless of the shard holding the file.
#[derive(Parser)]
#[command(version)]
struct CliOpts {
    /// Address of the coordinator.
    #[arg(
        short,
        long,
        env = "SHARDFS_COORDINATOR",
        default_value = "127.0.0.1:8000"
    )]
    coordinator: String,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload up to three files into a directory of the store.
    ///
    /// Missing directories are created.
    Upload {
        /// Local files to upload.
        #[arg(required = true, num_args = 1..=3)]
        files: Vec<PathBuf>,

        /// Destination directory, e.g. `~S1/docs`.
        destination: String,
    },

    /// Download up to two files.
    Download {
        /// Paths of the files, e.g. `~S1/docs/notes.txt`.
        #[arg(required = true, num_args = 1..=2)]
        paths: Vec<String>,

        /// Directory to save the files to.
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
    },

    /// Download an archive of all files of one type.
    Archive {
        /// File type: `.c`, `.pdf` or `.txt`.
        extension: String,

        /// File to save the archive to. Defaults to `<type>.tar` in the current directory.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Remove up to two files.
    Remove {
        /// Paths of the files, e.g. `~S1/docs/notes.txt`.
        #[arg(required = true, num_args = 1..=2)]
        paths: Vec<String>,
    },

    /// List the files in a directory across all shards.
    List {
        /// Directory to list, e.g. `~S1/docs`.
        path: String,
    },
}

impl Commands {
    /// Validates the arguments with the grammar the coordinator applies.
    fn to_command(&self) -> Result<Command, anyhow::Error> {
        let line = match self {
            Commands::Upload { files, destination } => {
                let files: Vec<_> = files.iter().map(|file| file.to_string_lossy()).collect();
                format!("uploadf {} {destination}", files.join(" "))
            }
            Commands::Download { paths, .. } => format!("downlf {}", paths.join(" ")),
            Commands::Archive { extension, .. } => format!("downltar {extension}"),
            Commands::Remove { paths } => format!("removef {}", paths.join(" ")),
            Commands::List { path } => format!("dispfnames {path}"),
        };
        Command::parse(&line).map_err(|err| anyhow!(err))
    }
}

fn main() -> Result<ExitCode, anyhow::Error> {
    let cli_opts = CliOpts::parse();
    let command = cli_opts.command.to_command()?;
    let mut client = CoordinatorClient::connect(&cli_opts.coordinator)
        .with_context(|| format!("Could not connect to: {}", cli_opts.coordinator))?;
    match (cli_opts.command, command) {
        (Commands::Upload { files, .. }, Command::Upload { dest, .. }) => {
            println!("{}", client.upload(&files, &dest).context("Upload failed")?);
        }
        (Commands::Download { output_dir, .. }, Command::Download { paths }) => {
            fs::create_dir_all(&output_dir).with_context(|| {
                format!("Could not create directory: {}", output_dir.display())
            })?;
            let sizes = client
                .download(&paths, |path| {
                    let target = target_path(&output_dir, path);
                    File::create(&target)
                        .map(BufWriter::new)
                        .with_path(target)
                })
                .context("Download failed")?;
            let mut missing = false;
            for (path, size) in paths.iter().zip(sizes) {
                match size {
                    Some(size) => println!(
                        "{path}: {size} bytes saved to {}",
                        target_path(&output_dir, path).display()
                    ),
                    None => {
                        eprintln!("{path}: file not found");
                        missing = true;
                    }
                }
            }
            if missing {
                return Ok(ExitCode::from(2));
            }
        }
        (Commands::Archive { output, .. }, Command::DownloadArchive { extension }) => {
            let output = output.unwrap_or_else(|| {
                PathBuf::from(format!("{}.tar", extension.trim_start_matches('.')))
            });
            let mut writer = File::create(&output)
                .map(BufWriter::new)
                .with_context(|| format!("Could not create: {}", output.display()))?;
            let size = client
                .download_archive(&extension, &mut writer)
                .context("Archive download failed")?;
            writer.flush()?;
            drop(writer);
            match size {
                Some(size) => println!("{size} bytes saved to {}", output.display()),
                None => {
                    fs::remove_file(&output)
                        .with_context(|| format!("Could not remove: {}", output.display()))?;
                    eprintln!("No archive available for {extension} files.");
                    return Ok(ExitCode::from(2));
                }
            }
        }
        (_, Command::Remove { paths }) => {
            println!("{}", client.remove(&paths).context("Remove failed")?);
        }
        (_, Command::List { path }) => {
            println!("{}", client.list(&path).context("Listing failed")?);
        }
        _ => unreachable!("arguments and command are parsed from the same subcommand"),
    }
    Ok(ExitCode::SUCCESS)
}

fn target_path(output_dir: &std::path::Path, path: &LogicalPath) -> PathBuf {
    output_dir.join(path.file_name().unwrap_or("download"))
}
