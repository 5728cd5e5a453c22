use clap::{Parser, Subcommand};
use solostation::builder::ScheduleBuilder;
use solostation::catalog::{Catalog, CatalogFile};
use solostation::config::{Lineup, Settings};
use solostation::db::Database;
use solostation::schedule::ScheduleStore;
use solostation::status::ChannelStatus;
use solostation::timecode::format_duration;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "solostation", about = "Broadcast TV simulator")]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build schedules for channels with no upcoming coverage
    Build {
        /// Discard upcoming entries and rebuild from the live one
        #[arg(long)]
        force: bool,
        /// Only this channel
        #[arg(short, long)]
        channel: Option<u32>,
    },
    /// Delete schedule entries that ended before the retention window
    Prune,
    /// Show what is airing on a channel
    Now { channel: u32 },
    /// List a channel's schedule
    Schedule { channel: u32 },
    /// Catalog management
    Catalog {
        #[command(subcommand)]
        action: CatalogCmd,
    },
    /// Write the status of every channel as JSON
    StatusExport { file: PathBuf },
    /// Tune in: drive mpv from the schedule
    Watch {
        /// Start on this channel instead of the last one watched
        #[arg(short, long)]
        channel: Option<u32>,
    },
}

#[derive(Subcommand)]
enum CatalogCmd {
    /// Load an ingestion result (JSON) into the catalog
    Import { file: PathBuf },
    /// Count catalog items per kind
    Stats,
}

fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let settings_path = cli.settings.unwrap_or_else(Settings::default_path);
    let settings = match Settings::load(&settings_path) {
        Ok(s) => s,
        Err(e) => fail(e),
    };
    let db = match Database::open(&settings.db_path) {
        Ok(db) => db,
        Err(e) => fail(e),
    };
    let now = chrono::Local::now().naive_local();

    match cli.command {
        Commands::Build { force, channel } => {
            let lineup = load_lineup(&settings.channel_file);
            let profiles: Vec<_> = lineup
                .channels
                .iter()
                .filter(|p| channel.is_none_or(|c| c == p.number))
                .cloned()
                .collect();
            if profiles.is_empty() {
                fail(format!("channel {} is not in the lineup", channel.unwrap_or_default()));
            }

            let builder = ScheduleBuilder::new(&db, settings.filler_path.clone());
            match builder.store().prune_elapsed(now, settings.retention()) {
                Ok(n) if n > 0 => println!("Pruned {} elapsed entries", n),
                Ok(_) => {}
                Err(e) => fail(e),
            }
            let outcomes = if force {
                builder.force_rebuild(&profiles, now)
            } else {
                builder.rebuild_due_channels(&profiles, now)
            };
            let outcomes = match outcomes {
                Ok(o) => o,
                Err(e) => fail(e),
            };
            if outcomes.is_empty() {
                println!("All channels already scheduled.");
            }
            let mut failed = false;
            for outcome in outcomes {
                match outcome.result {
                    Ok(report) => println!(
                        "Channel {}: {} entries, {} -> {}",
                        report.channel, report.entries, report.start, report.end
                    ),
                    Err(e) => {
                        failed = true;
                        eprintln!("Channel {}: {}", outcome.channel, e);
                    }
                }
            }
            if failed {
                std::process::exit(1);
            }
        }
        Commands::Prune => {
            let store = ScheduleStore::new(db);
            match store.prune_elapsed(now, settings.retention()) {
                Ok(n) => println!("Pruned {} entries", n),
                Err(e) => fail(e),
            }
        }
        Commands::Now { channel } => {
            let store = ScheduleStore::new(db.clone());
            let catalog = Catalog::new(db);
            match ChannelStatus::snapshot(&store, &catalog, channel, now) {
                Ok(status) => println!("{}", status.summary()),
                Err(e) => fail(e),
            }
        }
        Commands::Schedule { channel } => {
            let store = ScheduleStore::new(db);
            let entries = match store.entries_for_channel(channel) {
                Ok(e) => e,
                Err(e) => fail(e),
            };
            if entries.is_empty() {
                println!("Channel {} has no schedule. Run 'build' first.", channel);
            }
            for e in &entries {
                let marker = if e.covers(now) { ">" } else { " " };
                let chapter = e.chapter.map(|c| format!(" [ch {}]", c)).unwrap_or_default();
                println!(
                    "{} {}  {:>8}  {}{}",
                    marker,
                    e.showtime.format("%m-%d %H:%M:%S"),
                    format_duration(e.runtime),
                    e.content_ref,
                    chapter
                );
            }
        }
        Commands::Catalog { action } => {
            let catalog = Catalog::new(db);
            match action {
                CatalogCmd::Import { file } => {
                    if !file.exists() {
                        fail(format!("file '{}' not found", file.display()));
                    }
                    let summary = CatalogFile::load(&file).and_then(|f| catalog.import(&f));
                    match summary {
                        Ok(s) => println!(
                            "Imported {} items, {} chapters ({} chapters skipped)",
                            s.items, s.chapters, s.skipped_chapters
                        ),
                        Err(e) => fail(e),
                    }
                }
                CatalogCmd::Stats => match catalog.stats() {
                    Ok(stats) => {
                        for (kind, count) in stats {
                            println!("{:<12} {}", kind.as_str(), count);
                        }
                    }
                    Err(e) => fail(e),
                },
            }
        }
        Commands::StatusExport { file } => {
            let lineup = load_lineup(&settings.channel_file);
            let store = ScheduleStore::new(db.clone());
            let catalog = Catalog::new(db);
            let statuses: Result<Vec<_>, _> = lineup
                .numbers()
                .into_iter()
                .map(|n| ChannelStatus::snapshot(&store, &catalog, n, now))
                .collect();
            let written = statuses.and_then(|s| {
                let json = serde_json::to_string_pretty(&s)?;
                std::fs::write(&file, json)?;
                Ok(s.len())
            });
            match written {
                Ok(n) => println!("Wrote status for {} channels to {}", n, file.display()),
                Err(e) => fail(e),
            }
        }
        Commands::Watch { channel } => watch(&settings, &db, channel),
    }
}

#[cfg(unix)]
fn watch(settings: &Settings, db: &Database, channel: Option<u32>) {
    use solostation::config::TunerState;
    use solostation::player::MpvPlayer;
    use solostation::sync::{SystemClock, Synchronizer, initial_channel, tuner_channel};
    use std::time::Duration;

    let lineup = load_lineup(&settings.channel_file);
    let numbers = lineup.numbers();
    let state = TunerState::load(&settings.state_file);
    let start = match channel.or_else(|| initial_channel(&state, settings.default_channel, &numbers)) {
        Some(c) => c,
        None => fail("lineup has no channels"),
    };

    let (handle, rx) = tuner_channel();
    let player = match MpvPlayer::spawn(&settings.mpv_binary, &settings.mpv_socket, Some(handle.clone())) {
        Ok(p) => p,
        Err(e) => fail(e),
    };
    let builder = ScheduleBuilder::new(db, settings.filler_path.clone());
    let mut sync = Synchronizer::new(db, player, SystemClock, rx, numbers, start)
        .with_rebuilder(builder, lineup.channels)
        .with_state_file(settings.state_file.clone())
        .with_stall_timeout(Duration::from_secs(settings.stall_timeout_secs));
    if let Some(status) = &settings.status_file {
        sync = sync.with_status_file(status.clone());
    }
    println!("Tuned to channel {}. Keys: w/s or up/down to change channel.", start);
    sync.run();
    drop(handle);
}

#[cfg(not(unix))]
fn watch(_settings: &Settings, _db: &Database, _channel: Option<u32>) {
    fail("watch needs mpv's Unix socket IPC and is only available on Unix");
}

fn load_lineup(path: &Path) -> Lineup {
    match Lineup::load(path) {
        Ok(l) => l,
        Err(e) => fail(e),
    }
}

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", msg);
    std::process::exit(1);
}
