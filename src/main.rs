use std::env;
use std::fmt::Display;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use filevault::archive::BundleInfo;
use filevault::config::Settings;
use filevault::fs::{parse_sort_key, BatchAction, OnConflict, SandboxRoot, SelectionBatch};
use filevault::inspect::parse_hex_pattern;
use filevault::logging;
use filevault::task::{ProgressEvent, TaskHandle};
use filevault::utils::format::{format_entry_line, format_size};
use filevault::{Error, FileRepository, MutationOp, Result};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const PASSWORD_ENV: &str = "FILEVAULT_PASSWORD";
const NAME_COLUMN_WIDTH: usize = 48;
const DEFAULT_HEX_ROWS: usize = 16;

fn print_help() {
    println!("filevault {} - Sandboxed file repository", VERSION);
    println!();
    println!("USAGE:");
    println!("    filevault [--root <DIR>] <COMMAND> [ARGS...]");
    println!();
    println!("COMMANDS:");
    println!("    ls [DIR] [--sort name|date|size] [--search TEXT] [--contains HEX]");
    println!("    mkdir <PATH>...                 Create directories");
    println!("    touch <PATH>...                 Create empty files");
    println!("    cp <SRC> <DEST> [--overwrite|--fail-fast]");
    println!("    mv <SRC> <DEST> [--overwrite|--fail-fast]");
    println!("    rename <PATH> <NEW_NAME> [--auto-rename|--overwrite]");
    println!("    rm <PATH>...                    Delete files and directories");
    println!("    zip <DEST> <SRC>...             Compress into a zip archive");
    println!("    unzip <ARCHIVE> [DEST]          Extract a zip archive");
    println!("    ipa-info <ARCHIVE>              Print the bundle's Info.plist summary");
    println!("    import <FILE> [--overwrite|--fail-fast]");
    println!("                                    Copy or extract an outside file into DIR");
    println!("    encrypt <SRC> <DEST>            Encrypt (password from {} or stdin)", PASSWORD_ENV);
    println!("    decrypt <SRC> <DEST>            Decrypt");
    println!("    hexdump <FILE> [OFFSET] [ROWS]  Hex view");
    println!("    find-bytes <FILE> <HEX> [FROM]  First offset of a byte pattern");
    println!();
    println!("OPTIONS:");
    println!("    --root <DIR>            Sandbox root (default from settings)");
    println!("    -h, --help              Print help information");
    println!("    -v, --version           Print version information");
}

/// JSON status line on stderr, then exit 1
fn fail(message: impl Display) -> ! {
    eprintln!("{}", serde_json::json!({"status":"error","message":message.to_string()}));
    std::process::exit(1);
}

/// Poll progress until the task ends; failed items are echoed to stderr
fn finish<T>(handle: TaskHandle<T, Error>) -> Result<T> {
    while !handle.state().is_terminal() {
        report(handle.poll());
        thread::sleep(Duration::from_millis(50));
    }
    report(handle.poll());
    handle.wait().into_result()
}

fn report(events: Vec<ProgressEvent>) {
    for event in events {
        if let ProgressEvent::ItemFailed(item, reason) = event {
            eprintln!("{}: {}", item, reason);
        }
    }
}

fn parse_offset(value: &str) -> Option<u64> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Flags are collected anywhere after the command; the rest stay positional
struct CommandArgs {
    positional: Vec<String>,
    flags: Vec<(String, Option<String>)>,
}

impl CommandArgs {
    fn parse(args: &[String], valued: &[&str]) -> Self {
        let mut positional = Vec::new();
        let mut flags = Vec::new();
        let mut i = 0;
        while i < args.len() {
            let arg = &args[i];
            if valued.contains(&arg.as_str()) {
                if i + 1 >= args.len() {
                    fail(format!("{} requires a value", arg));
                }
                flags.push((arg.clone(), Some(args[i + 1].clone())));
                i += 2;
            } else if arg.starts_with("--") {
                flags.push((arg.clone(), None));
                i += 1;
            } else {
                positional.push(arg.clone());
                i += 1;
            }
        }
        Self { positional, flags }
    }

    fn has(&self, flag: &str) -> bool {
        self.flags.iter().any(|(f, _)| f == flag)
    }

    fn value(&self, flag: &str) -> Option<&str> {
        self.flags.iter().find(|(f, _)| f == flag).and_then(|(_, v)| v.as_deref())
    }

    fn policy(&self, default: OnConflict) -> OnConflict {
        if self.has("--overwrite") {
            OnConflict::Overwrite
        } else if self.has("--fail-fast") {
            OnConflict::FailFast
        } else if self.has("--auto-rename") {
            OnConflict::AutoRename
        } else {
            default
        }
    }

    fn require(&self, count: usize, usage: &str) {
        if self.positional.len() < count {
            fail(format!("usage: filevault {}", usage));
        }
    }
}

fn read_password() -> Result<String> {
    if let Ok(password) = env::var(PASSWORD_ENV) {
        return Ok(password);
    }
    eprint!("Password: ");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        fail("empty password");
    }
    Ok(password)
}

/// Leading `/` is the sandbox root; the last component is left unresolved
fn vault_path(repo: &FileRepository, input: &str) -> PathBuf {
    match input.strip_prefix('/') {
        Some(rest) => repo.root().path().join(rest),
        None => repo.current_directory().join(input),
    }
}

/// "a/b/name" -> ("a/b", "name")
fn split_parent(repo: &FileRepository, input: &str) -> (PathBuf, String) {
    let path = vault_path(repo, input);
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| repo.current_directory().to_path_buf());
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    (parent, name)
}

/// Copy/move into an existing directory keeps the source name
fn destination_for(repo: &FileRepository, source: &str, dest: &str) -> PathBuf {
    match repo.resolve(dest) {
        Ok(resolved) if resolved.is_dir() => {
            let name = Path::new(source).file_name().map(PathBuf::from).unwrap_or_default();
            resolved.join(name)
        }
        _ => vault_path(repo, dest),
    }
}

fn cmd_ls(repo: &mut FileRepository, args: &CommandArgs) -> Result<()> {
    if let Some(dir) = args.positional.first() {
        repo.navigate_to(dir)?;
    }
    let sort_key = args.value("--sort").map(parse_sort_key);
    let entries = match args.value("--contains") {
        Some(hex) => finish(repo.search_contents(parse_hex_pattern(hex)?, sort_key))?,
        None => finish(repo.list_directory(sort_key, args.value("--search").map(str::to_string)))?,
    };

    println!("{}", repo.catalog().virtual_path());
    for entry in &entries {
        println!("{}", format_entry_line(entry, NAME_COLUMN_WIDTH));
    }
    match repo.disk_usage() {
        Some(usage) => println!("{} items, {} free", entries.len(), format_size(usage.available)),
        None => println!("{} items", entries.len()),
    }
    Ok(())
}

fn cmd_create(repo: &FileRepository, args: &CommandArgs, directory: bool) -> Result<()> {
    args.require(1, if directory { "mkdir <PATH>..." } else { "touch <PATH>..." });
    for path in &args.positional {
        let (parent, name) = split_parent(repo, path);
        let op = if directory {
            MutationOp::CreateDirectory { parent, name }
        } else {
            MutationOp::CreateFile { parent, name }
        };
        let created = finish(repo.mutate(op))?;
        println!("{}", repo.root().virtual_path(&created));
    }
    Ok(())
}

fn cmd_transfer(repo: &FileRepository, args: &CommandArgs, is_move: bool) -> Result<()> {
    args.require(2, if is_move { "mv <SRC> <DEST>" } else { "cp <SRC> <DEST>" });
    let source = vault_path(repo, &args.positional[0]);
    let destination = destination_for(repo, &args.positional[0], &args.positional[1]);
    let policy = args.policy(OnConflict::AutoRename);
    let op = if is_move {
        MutationOp::Move { source, destination, policy }
    } else {
        MutationOp::Copy { source, destination, policy }
    };
    let result = finish(repo.mutate(op))?;
    println!("{}", repo.root().virtual_path(&result));
    Ok(())
}

fn cmd_rename(repo: &FileRepository, args: &CommandArgs) -> Result<()> {
    args.require(2, "rename <PATH> <NEW_NAME>");
    let op = MutationOp::Rename {
        source: vault_path(repo, &args.positional[0]),
        new_name: args.positional[1].clone(),
        policy: args.policy(OnConflict::FailFast),
    };
    let result = finish(repo.mutate(op))?;
    println!("{}", repo.root().virtual_path(&result));
    Ok(())
}

fn cmd_rm(repo: &FileRepository, args: &CommandArgs) -> Result<()> {
    args.require(1, "rm <PATH>...");
    let mut batch = SelectionBatch::new(BatchAction::Delete);
    for path in &args.positional {
        batch.add(vault_path(repo, path));
    }
    let result = finish(repo.commit_batch(batch))?;
    for path in result.succeeded() {
        println!("removed {}", repo.root().virtual_path(path));
    }
    if !result.all_succeeded() {
        fail(result.summary());
    }
    Ok(())
}

fn cmd_zip(repo: &FileRepository, args: &CommandArgs) -> Result<()> {
    args.require(2, "zip <DEST> <SRC>...");
    let destination = vault_path(repo, &args.positional[0]);
    let sources = args.positional[1..].iter().map(|s| vault_path(repo, s)).collect();
    let written = finish(repo.compress(sources, destination))?;
    println!("{}", repo.root().virtual_path(&written));
    Ok(())
}

fn cmd_unzip(repo: &FileRepository, args: &CommandArgs) -> Result<()> {
    args.require(1, "unzip <ARCHIVE> [DEST]");
    let archive = vault_path(repo, &args.positional[0]);
    let destination = args.positional.get(1).map(|d| vault_path(repo, d));
    let summary = finish(repo.extract_archive(archive, destination))?;
    println!(
        "{}: {} files, {} directories, {}",
        repo.root().virtual_path(&summary.destination),
        summary.files,
        summary.directories,
        format_size(summary.bytes)
    );
    for skipped in &summary.skipped {
        eprintln!("skipped {}", skipped);
    }
    Ok(())
}

fn cmd_ipa_info(repo: &FileRepository, args: &CommandArgs) -> Result<()> {
    args.require(1, "ipa-info <ARCHIVE>");
    let archive = repo.resolve(&args.positional[0])?;
    let info = BundleInfo::from_archive(&archive)?;
    let json = serde_json::json!({
        "name": info.display_name,
        "bundle_identifier": info.bundle_identifier,
        "version": info.short_version,
        "build": info.version,
        "executable": info.executable,
        "minimum_os_version": info.minimum_os_version,
        "app_dir": info.app_dir,
    });
    println!("{}", serde_json::to_string_pretty(&json).unwrap_or_else(|_| json.to_string()));
    Ok(())
}

fn cmd_import(repo: &FileRepository, args: &CommandArgs) -> Result<()> {
    args.require(1, "import <FILE>");
    let source = env::current_dir()?.join(&args.positional[0]);
    let imported = finish(repo.import(source, args.policy(OnConflict::AutoRename)))?;
    println!("{}", repo.root().virtual_path(&imported));
    Ok(())
}

fn cmd_cipher(repo: &FileRepository, args: &CommandArgs, encrypt: bool) -> Result<()> {
    args.require(2, if encrypt { "encrypt <SRC> <DEST>" } else { "decrypt <SRC> <DEST>" });
    let source = vault_path(repo, &args.positional[0]);
    let destination = vault_path(repo, &args.positional[1]);
    let password = read_password()?;
    let handle = if encrypt {
        repo.encrypt_file(source, destination.clone(), password)
    } else {
        repo.decrypt_file(source, destination.clone(), password)
    };
    let written = finish(handle)?;
    println!("{} ({})", repo.root().virtual_path(&destination), format_size(written));
    Ok(())
}

fn cmd_hexdump(repo: &FileRepository, args: &CommandArgs) -> Result<()> {
    args.require(1, "hexdump <FILE> [OFFSET] [ROWS]");
    let file = vault_path(repo, &args.positional[0]);
    let offset = match args.positional.get(1) {
        Some(v) => parse_offset(v).unwrap_or_else(|| fail(format!("invalid offset: {}", v))),
        None => 0,
    };
    let rows = match args.positional.get(2) {
        Some(v) => v.parse().unwrap_or_else(|_| fail(format!("invalid row count: {}", v))),
        None => DEFAULT_HEX_ROWS,
    };
    let width = repo.settings().hex_row_width;
    let window = finish(repo.read_byte_row(file, offset, Some(width * rows)))?;
    print!("{}", window.render(width));
    Ok(())
}

fn cmd_find_bytes(repo: &FileRepository, args: &CommandArgs) -> Result<()> {
    args.require(2, "find-bytes <FILE> <HEX> [FROM]");
    let file = vault_path(repo, &args.positional[0]);
    let pattern = parse_hex_pattern(&args.positional[1])?;
    let from = match args.positional.get(2) {
        Some(v) => parse_offset(v).unwrap_or_else(|| fail(format!("invalid offset: {}", v))),
        None => 0,
    };
    match finish(repo.search_bytes(file, pattern, from))? {
        Some(offset) => println!("0x{:08X}", offset),
        None => fail("pattern not found"),
    }
    Ok(())
}

fn open_repository(root: Option<&str>) -> Result<FileRepository> {
    let settings = match Settings::load_with_error() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Settings error: {} (using defaults)", e);
            Settings::default()
        }
    };
    if let Err(e) = logging::init(&settings.log_settings()) {
        eprintln!("{}", e);
    }
    match root {
        Some(dir) => FileRepository::with_root(SandboxRoot::create(dir)?, settings),
        None => FileRepository::open(settings),
    }
}

fn run(args: &[String]) -> Result<()> {
    let mut root: Option<String> = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "-v" | "--version" => {
                println!("filevault {}", VERSION);
                return Ok(());
            }
            "--root" => {
                if i + 1 >= args.len() {
                    fail("--root requires a directory");
                }
                root = Some(args[i + 1].clone());
                i += 2;
            }
            arg if arg.starts_with('-') => {
                eprintln!("Unknown option: {}", arg);
                eprintln!("Use --help for usage information");
                return Ok(());
            }
            _ => break,
        }
    }

    let Some(command) = args.get(i) else {
        print_help();
        return Ok(());
    };
    let rest = CommandArgs::parse(&args[i + 1..], &["--sort", "--search", "--contains"]);
    let mut repo = open_repository(root.as_deref())?;

    match command.as_str() {
        "ls" => cmd_ls(&mut repo, &rest),
        "mkdir" => cmd_create(&repo, &rest, true),
        "touch" => cmd_create(&repo, &rest, false),
        "cp" => cmd_transfer(&repo, &rest, false),
        "mv" => cmd_transfer(&repo, &rest, true),
        "rename" => cmd_rename(&repo, &rest),
        "rm" => cmd_rm(&repo, &rest),
        "zip" => cmd_zip(&repo, &rest),
        "unzip" => cmd_unzip(&repo, &rest),
        "ipa-info" => cmd_ipa_info(&repo, &rest),
        "import" => cmd_import(&repo, &rest),
        "encrypt" => cmd_cipher(&repo, &rest, true),
        "decrypt" => cmd_cipher(&repo, &rest, false),
        "hexdump" => cmd_hexdump(&repo, &rest),
        "find-bytes" => cmd_find_bytes(&repo, &rest),
        other => fail(format!("unknown command: {} (see --help)", other)),
    }
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    if let Err(e) = run(&args) {
        fail(e);
    }
}
