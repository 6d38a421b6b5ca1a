#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use serde::Serialize;
use sfs::{CacheStats, FileSystem, FormatOptions, MountOptions, Node, Superblock};
use std::env;
use std::io::Write;
use std::path::Path;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter (`tracing` directive syntax).
const LOG_ENV: &str = "SFS_LOG";

#[derive(Debug, Serialize)]
struct InfoOutput {
    superblock: Superblock,
    free_sectors: u32,
    used_sectors: u32,
    cache: CacheStats,
}

/// Positional arguments plus the flags every command understands.
#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    positional: Vec<String>,
    cache_slots: Option<usize>,
    sectors: Option<u32>,
    json: bool,
}

fn parse_args(raw: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut out = Args::default();
    let mut raw = raw.into_iter();
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--json" => out.json = true,
            "--cache-slots" => {
                let Some(value) = raw.next() else {
                    bail!("--cache-slots requires a value");
                };
                out.cache_slots = Some(
                    value
                        .parse()
                        .with_context(|| format!("invalid --cache-slots value: {value}"))?,
                );
            }
            "--sectors" => {
                let Some(value) = raw.next() else {
                    bail!("--sectors requires a value");
                };
                out.sectors = Some(
                    value
                        .parse()
                        .with_context(|| format!("invalid --sectors value: {value}"))?,
                );
            }
            flag if flag.starts_with("--") => bail!("unknown flag: {flag}"),
            _ => out.positional.push(arg),
        }
    }
    Ok(out)
}

impl Args {
    fn mount_options(&self) -> MountOptions {
        let mut opts = MountOptions::default();
        if let Some(slots) = self.cache_slots {
            opts.cache_slots = slots;
        }
        opts
    }
}

fn main() {
    init_logging();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<()> {
    let mut raw = env::args().skip(1);
    let Some(command) = raw.next() else {
        print_usage();
        return Ok(());
    };
    let args = parse_args(raw)?;
    debug!(command = command.as_str(), ?args, "parsed command line");

    match (command.as_str(), args.positional.as_slice()) {
        ("format", [image]) => format_cmd(Path::new(image), &args),
        ("info", [image]) => info_cmd(Path::new(image), &args),
        ("ls", [image]) => ls_cmd(Path::new(image), "/", &args),
        ("ls", [image, path]) => ls_cmd(Path::new(image), path, &args),
        ("mkdir", [image, path]) => with_session(Path::new(image), &args, |session| {
            session.mkdir(path).with_context(|| format!("mkdir {path}"))
        }),
        ("put", [image, host, path]) => put_cmd(Path::new(image), Path::new(host), path, &args),
        ("cat", [image, path]) => cat_cmd(Path::new(image), path, &args),
        ("rm", [image, path]) => with_session(Path::new(image), &args, |session| {
            session.remove(path).with_context(|| format!("rm {path}"))
        }),
        ("--help" | "-h" | "help", _) => {
            print_usage();
            Ok(())
        }
        ("format" | "info" | "ls" | "mkdir" | "put" | "cat" | "rm", _) => {
            print_usage();
            bail!("wrong number of arguments for {command}")
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("sfs-cli\n");
    println!("USAGE:");
    println!("  sfs-cli format <image> [--sectors N]");
    println!("  sfs-cli info <image> [--json]");
    println!("  sfs-cli ls <image> [path]");
    println!("  sfs-cli mkdir <image> <path>");
    println!("  sfs-cli put <image> <host-file> <path>");
    println!("  sfs-cli cat <image> <path>");
    println!("  sfs-cli rm <image> <path>");
    println!();
    println!("Every command accepts --cache-slots N. Set {LOG_ENV}=debug for logs.");
}

fn open_fs(image: &Path, args: &Args) -> Result<FileSystem> {
    FileSystem::open_image(image, &args.mount_options())
        .with_context(|| format!("failed to mount image: {}", image.display()))
}

/// Mount, run `op` in a fresh session, then unmount (even if `op` failed,
/// so nothing it already changed is lost).
fn with_session(
    image: &Path,
    args: &Args,
    op: impl FnOnce(&mut sfs::Session) -> Result<()>,
) -> Result<()> {
    let fs = open_fs(image, args)?;
    let mut session = fs.session().context("failed to open session")?;
    let outcome = op(&mut session);
    drop(session);
    fs.unmount().context("failed to unmount")?;
    outcome
}

fn format_cmd(image: &Path, args: &Args) -> Result<()> {
    let mut opts = FormatOptions::default();
    if let Some(sectors) = args.sectors {
        opts.sector_count = sectors;
    }
    let fs = FileSystem::create_image(image, &opts, &args.mount_options())
        .with_context(|| format!("failed to format image: {}", image.display()))?;
    let free = fs.free_sectors();
    fs.unmount().context("failed to unmount")?;
    println!(
        "formatted {} ({} sectors, {free} free)",
        image.display(),
        opts.sector_count
    );
    Ok(())
}

fn info_cmd(image: &Path, args: &Args) -> Result<()> {
    let fs = open_fs(image, args)?;
    let info = fs.info();
    let output = InfoOutput {
        superblock: info.superblock,
        free_sectors: info.free_sectors,
        used_sectors: info.superblock.sector_count - info.free_sectors,
        cache: info.cache,
    };
    fs.unmount().context("failed to unmount")?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("SectorFS image: {}", image.display());
        println!("version: {}", output.superblock.version);
        println!("sector_count: {}", output.superblock.sector_count);
        println!("free_map_sectors: {}", output.superblock.free_map_sectors);
        println!("free_sectors: {}", output.free_sectors);
        println!("used_sectors: {}", output.used_sectors);
    }
    Ok(())
}

fn ls_cmd(image: &Path, path: &str, args: &Args) -> Result<()> {
    with_session(image, args, |session| {
        let mut names = session.list(path).with_context(|| format!("ls {path}"))?;
        names.sort();
        for name in names {
            println!("{name}");
        }
        Ok(())
    })
}

fn put_cmd(image: &Path, host: &Path, path: &str, args: &Args) -> Result<()> {
    let data =
        std::fs::read(host).with_context(|| format!("failed to read {}", host.display()))?;
    with_session(image, args, |session| {
        session
            .create(path, 0)
            .with_context(|| format!("create {path}"))?;
        let mut file = session.open(path)?.into_file()?;
        let written = file.write(&data)?;
        file.close()?;
        if written != data.len() {
            bail!("short write to {path}: {written} of {} bytes", data.len());
        }
        Ok(())
    })
}

fn cat_cmd(image: &Path, path: &str, args: &Args) -> Result<()> {
    with_session(image, args, |session| {
        let node = session.open(path).with_context(|| format!("open {path}"))?;
        let mut file = match node {
            Node::File(file) => file,
            dir @ Node::Dir(_) => {
                session.close(dir)?;
                bail!("{path} is a directory");
            }
        };
        let mut data = vec![0_u8; usize::try_from(file.len())?];
        let read = file.read(&mut data)?;
        file.close()?;
        std::io::stdout()
            .write_all(&data[..read])
            .context("write to stdout")?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn flags_are_pulled_out_of_positionals() {
        let args = parse_args(strings(&["disk.img", "--cache-slots", "8", "/a", "--json"]))
            .expect("parse");
        assert_eq!(args.positional, ["disk.img", "/a"]);
        assert_eq!(args.cache_slots, Some(8));
        assert!(args.json);
        assert_eq!(args.mount_options().cache_slots, 8);
    }

    #[test]
    fn bad_flags_are_rejected() {
        assert!(parse_args(strings(&["--cache-slots"])).is_err());
        assert!(parse_args(strings(&["--sectors", "lots"])).is_err());
        assert!(parse_args(strings(&["--verbose"])).is_err());
    }

    #[test]
    fn commands_round_trip_an_image() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("disk.img");
        let host = dir.path().join("hello.txt");
        std::fs::write(&host, b"hello from the host").expect("write host file");

        let args = parse_args(strings(&["--sectors", "1024"])).expect("parse");
        format_cmd(&image, &args).expect("format");
        let defaults = Args::default();
        with_session(&image, &defaults, |s| Ok(s.mkdir("/docs")?)).expect("mkdir");
        put_cmd(&image, &host, "/docs/hello", &defaults).expect("put");

        let fs = open_fs(&image, &defaults).expect("mount");
        let mut session = fs.session().expect("session");
        assert_eq!(session.list("/docs").expect("list"), ["hello"]);
        let mut file = session
            .open("/docs/hello")
            .expect("open")
            .into_file()
            .expect("file");
        let mut buf = vec![0_u8; 64];
        let read = file.read(&mut buf).expect("read");
        assert_eq!(&buf[..read], b"hello from the host");
        file.close().expect("close");
        drop(session);
        fs.unmount().expect("unmount");

        with_session(&image, &defaults, |s| Ok(s.remove("/docs/hello")?)).expect("rm");
        let fs = open_fs(&image, &defaults).expect("mount");
        assert_eq!(fs.superblock().sector_count, 1024);
    }
}
