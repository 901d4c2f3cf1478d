use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use atelier_contracts::chat::{parse_command, ChatCommand, CHAT_HELP_COMMANDS};
use atelier_contracts::events::EventWriter;
use atelier_contracts::records::spawn_retention_sweeper;
use atelier_contracts::{ImageRecord, InpaintMode, LineageStore, ServiceConfig};
use atelier_engine::{DerivationOrchestrator, HttpTransport, UploadOutcome};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "atelier", version, about = "Image derivation client")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// JSON config file; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, default_value = "storage/images.jsonl")]
    store: PathBuf,
    /// Event log; defaults to `events.jsonl` next to the store.
    #[arg(long, global = true)]
    events: Option<PathBuf>,
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    Generate(GenerateArgs),
    Reference(ReferenceArgs),
    Edit(EditArgs),
    Outpaint(OutpaintArgs),
    Inpaint(InpaintArgs),
    Cutout(CutoutArgs),
    Regenerate(RecordArgs),
    Show(RecordArgs),
    Latest,
    Pick(PickArgs),
    Compose(ComposeArgs),
    Mask(MaskArgs),
    Purge(PurgeArgs),
    Chat(ChatArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    style: Option<String>,
    #[arg(long)]
    ratio: Option<String>,
}

#[derive(Debug, Parser)]
struct ReferenceArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    style: Option<String>,
    #[arg(long)]
    ratio: Option<String>,
}

#[derive(Debug, Parser)]
struct EditArgs {
    #[arg(long)]
    id: String,
    #[arg(long, default_value_t = 1)]
    index: usize,
    #[arg(long)]
    prompt: String,
}

#[derive(Debug, Parser)]
struct OutpaintArgs {
    #[arg(long)]
    id: String,
    #[arg(long, default_value_t = 1)]
    index: usize,
    #[arg(long, default_value = "4:3")]
    ratio: String,
}

#[derive(Debug, Parser)]
struct InpaintArgs {
    #[arg(long)]
    original: PathBuf,
    #[arg(long)]
    marked: PathBuf,
    #[arg(long)]
    prompt: String,
    /// Diff the images instead of filling a drawn loop.
    #[arg(long)]
    brush: bool,
    #[arg(long)]
    invert: bool,
}

#[derive(Debug, Parser)]
struct CutoutArgs {
    #[arg(long)]
    image: PathBuf,
}

#[derive(Debug, Parser)]
struct RecordArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Parser)]
struct PickArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    index: usize,
}

#[derive(Debug, Parser)]
struct ComposeArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct MaskArgs {
    #[arg(long)]
    original: PathBuf,
    #[arg(long)]
    marked: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    brush: bool,
    #[arg(long)]
    invert: bool,
}

#[derive(Debug, Parser)]
struct PurgeArgs {
    /// Overrides the configured retention window.
    #[arg(long)]
    days: Option<u32>,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long, default_value = "local")]
    user: String,
    /// Where `/compose` writes when no path is given.
    #[arg(long, default_value = "storage/deliverables")]
    out: PathBuf,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("atelier error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);

    if let Command::Mask(args) = &cli.command {
        run_mask(args)?;
        return Ok(0);
    }

    let orchestrator = open_orchestrator(&cli.global)?;
    match cli.command {
        Command::Generate(args) => {
            let record = orchestrator.submit_generation(
                &args.prompt,
                args.style.as_deref(),
                args.ratio.as_deref(),
            )?;
            print_record(&record);
        }
        Command::Reference(args) => {
            let image = read_image(&args.image)?;
            let record = orchestrator.submit_reference(
                &image,
                &args.prompt,
                args.style.as_deref(),
                args.ratio.as_deref(),
            )?;
            print_record(&record);
        }
        Command::Edit(args) => {
            let record = orchestrator.submit_edit(&args.id, args.index, &args.prompt)?;
            print_record(&record);
        }
        Command::Outpaint(args) => {
            let record = orchestrator.submit_outpaint(&args.id, args.index, &args.ratio)?;
            print_record(&record);
        }
        Command::Inpaint(args) => {
            let original = read_image(&args.original)?;
            let marked = read_image(&args.marked)?;
            let record = orchestrator.submit_inpaint(
                &original,
                &marked,
                &args.prompt,
                inpaint_mode(args.brush),
                args.invert,
            )?;
            print_record(&record);
        }
        Command::Cutout(args) => {
            let image = read_image(&args.image)?;
            let record = orchestrator.submit_background_removal(&image)?;
            print_record(&record);
        }
        Command::Regenerate(args) => {
            let record = orchestrator.regenerate(&args.id)?;
            print_record(&record);
        }
        Command::Show(args) => show_record(&orchestrator, &args.id)?,
        Command::Latest => match orchestrator.get_latest() {
            Some(record) => print_record(&record),
            None => {
                println!("No records yet.");
                return Ok(1);
            }
        },
        Command::Pick(args) => println!("{}", orchestrator.select_image(&args.id, args.index)?),
        Command::Compose(args) => {
            let path = compose_record(&orchestrator, &args.id, &args.out)?;
            println!("{}", path.display());
        }
        Command::Purge(args) => {
            let window = match args.days {
                Some(days) => chrono::Duration::days(i64::from(days)),
                None => orchestrator.config().retention_window(),
            };
            let purged = orchestrator.store().purge_older_than(Utc::now() - window)?;
            println!("Purged {purged} records.");
        }
        Command::Chat(args) => run_chat(&orchestrator, &args)?,
        Command::Mask(_) => {}
    }
    Ok(0)
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn open_orchestrator(global: &GlobalArgs) -> Result<DerivationOrchestrator> {
    let config = ServiceConfig::load_or_default(global.config.as_deref())?;
    let store_dir = global
        .store
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    if !store_dir.as_os_str().is_empty() {
        fs::create_dir_all(&store_dir)
            .with_context(|| format!("failed to create {}", store_dir.display()))?;
    }
    let store = LineageStore::open(&global.store)
        .with_context(|| format!("failed to open store {}", global.store.display()))?;
    let events_path = global
        .events
        .clone()
        .unwrap_or_else(|| store_dir.join("events.jsonl"));
    let session_id = format!("cli-{}", Utc::now().format("%Y%m%dT%H%M%S"));
    tracing::debug!(
        store = %global.store.display(),
        events = %events_path.display(),
        api_base = %config.api_base,
        "opening orchestrator"
    );
    let transport = HttpTransport::new(&config)?;
    Ok(DerivationOrchestrator::new(
        Box::new(transport),
        Arc::new(store),
        config,
        EventWriter::new(events_path, session_id),
    ))
}

fn inpaint_mode(brush: bool) -> InpaintMode {
    if brush {
        InpaintMode::Brush
    } else {
        InpaintMode::Circle
    }
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read image {}", path.display()))
}

fn print_record(record: &ImageRecord) {
    let parent = record
        .parent_id
        .as_deref()
        .map(|parent| format!(" (from {parent})"))
        .unwrap_or_default();
    println!("{} [{}]{parent}", record.id, record.kind().as_str());
    for (idx, url) in record.urls.iter().enumerate() {
        println!("  {}. {url}", idx + 1);
    }
}

fn show_record(orchestrator: &DerivationOrchestrator, record_id: &str) -> Result<()> {
    let Some(record) = orchestrator.get_record(record_id) else {
        bail!("unknown record {record_id}");
    };
    println!("{}", serde_json::to_string_pretty(&record.to_row()?)?);
    let ancestors = orchestrator.store().lineage(record_id);
    if !ancestors.is_empty() {
        let chain: Vec<&str> = ancestors.iter().map(|r| r.id.as_str()).collect();
        println!("lineage: {record_id} <- {}", chain.join(" <- "));
    }
    let children = orchestrator.store().children_of(record_id);
    if !children.is_empty() {
        let ids: Vec<&str> = children.iter().map(|r| r.id.as_str()).collect();
        println!("derived: {}", ids.join(", "));
    }
    Ok(())
}

fn compose_record(
    orchestrator: &DerivationOrchestrator,
    record_id: &str,
    out: &Path,
) -> Result<PathBuf> {
    let Some(record) = orchestrator.get_record(record_id) else {
        bail!("unknown record {record_id}");
    };
    let composite = orchestrator.render_deliverable(&record)?;
    let path = deliverable_path(out, record_id);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, composite.to_jpeg()?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// `out` is used as is when it names a file; otherwise it is a directory and
/// the composite is saved as `<id>.jpg` inside it.
fn deliverable_path(out: &Path, record_id: &str) -> PathBuf {
    if out.extension().is_some() {
        out.to_path_buf()
    } else {
        out.join(format!("{record_id}.jpg"))
    }
}

fn run_mask(args: &MaskArgs) -> Result<()> {
    let original = read_image(&args.original)?;
    let marked = read_image(&args.marked)?;
    let mask =
        atelier_engine::build_mask(inpaint_mode(args.brush), &original, &marked, args.invert)?;
    fs::write(&args.out, mask.to_png()?)
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    println!(
        "{} ({}x{}, {} pixels selected)",
        args.out.display(),
        mask.width(),
        mask.height(),
        mask.selected_pixels()
    );
    Ok(())
}

fn run_chat(orchestrator: &DerivationOrchestrator, args: &ChatArgs) -> Result<()> {
    let config = orchestrator.config();
    let _sweeper = spawn_retention_sweeper(
        orchestrator.store(),
        config.retention_window(),
        Duration::from_secs(config.storage.sweep_interval_secs.max(1)),
    );
    let user = args.user.as_str();
    let stdin = io::stdin();
    let mut line = String::new();

    println!("Atelier chat started. Type /help for commands.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let command = parse_command(line.trim_end_matches(['\n', '\r']));
        if command == ChatCommand::Quit {
            break;
        }
        // One failed command never ends the loop.
        if let Err(err) = handle_chat_command(orchestrator, user, &args.out, command) {
            println!("Error: {err:#}");
        }
    }
    Ok(())
}

fn handle_chat_command(
    orchestrator: &DerivationOrchestrator,
    user: &str,
    out_dir: &Path,
    command: ChatCommand,
) -> Result<()> {
    match command {
        ChatCommand::Noop | ChatCommand::Quit => {}
        ChatCommand::Help => println!("Commands: {}", CHAT_HELP_COMMANDS.join("  ")),
        ChatCommand::Usage(usage) => println!("Usage: {usage}"),
        ChatCommand::Unknown(command) => println!("Unknown command: /{command}"),
        ChatCommand::Generate {
            prompt,
            style,
            ratio,
        } => {
            println!("Generating...");
            let record =
                orchestrator.submit_generation(&prompt, style.as_deref(), ratio.as_deref())?;
            print_record(&record);
        }
        ChatCommand::Reference {
            prompt,
            style,
            ratio,
        } => {
            orchestrator.begin_reference(user, &prompt, style.as_deref(), ratio.as_deref())?;
            println!("Send the reference image with /upload <path>.");
        }
        ChatCommand::Edit {
            record_id,
            index,
            prompt,
        } => {
            let record = orchestrator.submit_edit(&record_id, index, &prompt)?;
            print_record(&record);
        }
        ChatCommand::Outpaint {
            record_id,
            index,
            ratio,
        } => {
            let ratio = ratio.unwrap_or_else(|| orchestrator.config().default_ratio.clone());
            let record = orchestrator.submit_outpaint(&record_id, index, &ratio)?;
            print_record(&record);
        }
        ChatCommand::Inpaint {
            prompt,
            mode,
            invert,
        } => {
            orchestrator.begin_inpaint(user, &prompt, mode, invert)?;
            println!("Send the original image with /upload <path>.");
        }
        ChatCommand::Cutout => {
            orchestrator.begin_background_removal(user)?;
            println!("Send the image to cut out with /upload <path>.");
        }
        ChatCommand::Upload { path } => {
            let image = read_image(Path::new(&path))?;
            match orchestrator.handle_upload(user, &image)? {
                UploadOutcome::Ignored => println!("Nothing is waiting for an image."),
                UploadOutcome::AwaitingMarkedImage => {
                    println!("Now send a copy with the region marked, using /upload <path>.")
                }
                UploadOutcome::Completed(record) => print_record(&record),
            }
        }
        ChatCommand::Regenerate { record_id } => {
            let record = orchestrator.regenerate(&record_id)?;
            print_record(&record);
        }
        ChatCommand::Pick { record_id, index } => {
            println!("{}", orchestrator.select_image(&record_id, index)?);
        }
        ChatCommand::Show { record_id } => show_record(orchestrator, &record_id)?,
        ChatCommand::Latest => match orchestrator.get_latest() {
            Some(record) => print_record(&record),
            None => println!("No records yet."),
        },
        ChatCommand::Compose { record_id, path } => {
            let out = path.map(PathBuf::from).unwrap_or_else(|| out_dir.to_path_buf());
            let written = compose_record(orchestrator, &record_id, &out)?;
            println!("Saved {}", written.display());
        }
        ChatCommand::Cancel => {
            if orchestrator.cancel(user) {
                println!("Cancelled.");
            } else {
                println!("Nothing to cancel.");
            }
        }
        ChatCommand::Reset => {
            orchestrator.reset_session();
            println!("The next prompt starts a new conversation.");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use atelier_contracts::InpaintMode;
    use clap::Parser;

    use super::{deliverable_path, inpaint_mode, Cli, Command};

    #[test]
    fn deliverable_path_appends_record_jpg_to_directories() {
        assert_eq!(
            deliverable_path(Path::new("out"), "1700000000"),
            PathBuf::from("out/1700000000.jpg")
        );
        assert_eq!(
            deliverable_path(Path::new("out/previews/latest.jpeg"), "1700000000"),
            PathBuf::from("out/previews/latest.jpeg")
        );
    }

    #[test]
    fn brush_flag_selects_diff_masks() {
        assert_eq!(inpaint_mode(true), InpaintMode::Brush);
        assert_eq!(inpaint_mode(false), InpaintMode::Circle);
    }

    #[test]
    fn global_flags_parse_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "atelier",
            "inpaint",
            "--original",
            "a.png",
            "--marked",
            "b.png",
            "--prompt",
            "make it night",
            "--brush",
            "--store",
            "/tmp/images.jsonl",
            "-v",
        ])
        .unwrap();
        assert!(cli.global.verbose);
        assert_eq!(cli.global.store, PathBuf::from("/tmp/images.jsonl"));
        match cli.command {
            Command::Inpaint(args) => {
                assert!(args.brush);
                assert!(!args.invert);
                assert_eq!(args.prompt, "make it night");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn store_defaults_under_storage() {
        let cli = Cli::try_parse_from(["atelier", "latest"]).unwrap();
        assert_eq!(cli.global.store, PathBuf::from("storage/images.jsonl"));
        assert!(cli.global.events.is_none());
        assert!(matches!(cli.command, Command::Latest));
    }
}
