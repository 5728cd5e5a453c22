//! Headless integration tests for solostation.
//!
//! Build whole channel days into an in-memory database and tune into them
//! with a fake player on a manual clock. No mpv, no wall clock.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use solostation::builder::ScheduleBuilder;
use solostation::catalog::{Catalog, CatalogFile, CatalogRecord, select_weighted};
use solostation::chapters::{self, ChapterIndex};
use solostation::config::{ChannelProfile, Lineup, SlotRule, Strategy, TunerState};
use solostation::db::Database;
use solostation::media::{Chapter, ContentItem, MediaDetails};
use solostation::player::FakePlayer;
use solostation::schedule::{ScheduleEntry, ScheduleStore};
use solostation::sync::{Clock, ManualClock, Outcome, Synchronizer, compute_offset, tuner_channel};
use std::collections::HashMap;

const FILLER: &str = "/media/filler.mp4";

fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 1)
        .unwrap()
        .and_hms_opt(h, m, s)
        .unwrap()
}

fn record(path: &str, details: MediaDetails, secs: i64, tags: &[&str]) -> CatalogRecord {
    CatalogRecord {
        item: ContentItem {
            filepath: path.to_string(),
            title: path.rsplit('/').next().unwrap_or(path).to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            runtime: TimeDelta::seconds(secs),
            last_played: None,
            details,
        },
        chapters: Vec::new(),
    }
}

fn episode(path: &str, show: &str, secs: i64, bounds: &[(i64, i64)], tags: &[&str]) -> CatalogRecord {
    let mut r = record(
        path,
        MediaDetails::Episode {
            show: show.to_string(),
            season: 1,
            episode: 1,
        },
        secs,
        tags,
    );
    r.chapters = bounds
        .iter()
        .enumerate()
        .map(|(i, (s, e))| Chapter {
            index: i as u32 + 1,
            start: TimeDelta::seconds(*s),
            end: TimeDelta::seconds(*e),
        })
        .collect();
    r
}

fn commercials() -> Vec<CatalogRecord> {
    (0..12)
        .map(|i| {
            record(
                &format!("/ads/spot{i}.mp4"),
                MediaDetails::Commercial,
                [15, 30, 30, 45, 60, 20][i % 6],
                &[],
            )
        })
        .collect()
}

fn station_catalog() -> Vec<CatalogRecord> {
    let mut items = commercials();
    items.push(record(FILLER, MediaDetails::Commercial, 600, &["filler"]));
    items.push(episode("/tv/sitcom/e1.mkv", "Sitcom", 1320, &[(0, 440), (440, 880), (880, 1320)], &["sitcom"]));
    items.push(episode("/tv/sitcom/e2.mkv", "Sitcom", 1290, &[(0, 1230), (1230, 1290)], &["sitcom"]));
    items.push(episode("/tv/sitcom/e3.mkv", "Sitcom", 1310, &[], &["sitcom"]));
    items.push(episode("/tv/drama/d1.mkv", "Drama", 2650, &[(0, 900), (900, 1800), (1800, 2650)], &["drama"]));
    items.push(record("/movies/m1.mkv", MediaDetails::Movie { year: Some(1985) }, 5700, &["drama", "movie"]));
    items.push(record("/movies/m2.mkv", MediaDetails::Movie { year: Some(1991) }, 6300, &["movie"]));
    items.push(record("/web/trailer.mp4", MediaDetails::Web, 150, &[]));
    for i in 0..5 {
        items.push(record(
            &format!("/music/v{i}.mp4"),
            MediaDetails::Music { artist: format!("Band {i}") },
            210 + i as i64 * 10,
            &["rock"],
        ));
    }
    items.push(record("/idents/mtv.mp4", MediaDetails::Ident, 8, &[]));
    items
}

fn lineup() -> Lineup {
    let profile = |number: u32, strategy: Strategy, tags: &[&str]| ChannelProfile {
        number,
        name: format!("Channel {number}"),
        strategy,
        tags: tags.iter().map(|t| t.to_string()).collect(),
        commercials: true,
        slots: Vec::new(),
        run_until: None,
    };
    let mut sitcoms = profile(2, Strategy::TagRotation, &["sitcom"]);
    sitcoms.slots = vec![
        SlotRule {
            from: NaiveTime::MIN,
            tags: vec!["sitcom".into()],
        },
        SlotRule {
            from: NaiveTime::from_hms_opt(21, 0, 0).unwrap(),
            tags: vec!["drama".into()],
        },
    ];
    Lineup {
        channels: vec![
            sitcoms,
            profile(3, Strategy::NonstopMusic, &["rock"]),
            profile(4, Strategy::NonstopMovie, &["movie"]),
            profile(5, Strategy::SingleMovieLoop, &["movie"]),
        ],
    }
}

fn station() -> (Database, ScheduleBuilder) {
    let db = Database::open_in_memory().unwrap();
    Catalog::new(db.clone())
        .import(&CatalogFile {
            items: station_catalog(),
        })
        .unwrap();
    let builder = ScheduleBuilder::new(&db, FILLER).with_seed(2024);
    (db, builder)
}

fn assert_contiguous(entries: &[ScheduleEntry]) {
    assert!(!entries.is_empty());
    for e in entries {
        assert_eq!(e.end, e.showtime + e.runtime, "{e:?}");
        assert!(e.runtime > TimeDelta::zero(), "{e:?}");
    }
    for pair in entries.windows(2) {
        assert_eq!(pair[0].end, pair[1].showtime, "gap or overlap at {:?}", pair[1]);
    }
}

// ── Building ─────────────────────────────────────────────────────────────

#[test]
fn full_day_rebuild_covers_every_channel_without_gaps() {
    let (_, builder) = station();
    let lineup = lineup();
    let outcomes = builder.rebuild_due_channels(&lineup.channels, at(6, 0, 0)).unwrap();
    assert_eq!(outcomes.len(), 4);

    let midnight = at(0, 0, 0);
    for outcome in &outcomes {
        let report = outcome.result.as_ref().unwrap();
        let entries = builder.store().entries_for_channel(outcome.channel).unwrap();
        assert_contiguous(&entries);
        assert_eq!(entries[0].showtime, midnight);
        assert!(
            entries.last().unwrap().end >= midnight + TimeDelta::days(1),
            "channel {} stops at {}",
            outcome.channel,
            report.end
        );
    }
}

#[test]
fn rebuild_check_is_idempotent() {
    let (_, builder) = station();
    let lineup = lineup();
    builder.rebuild_due_channels(&lineup.channels, at(6, 0, 0)).unwrap();
    let before: HashMap<u32, Vec<ScheduleEntry>> = lineup
        .numbers()
        .into_iter()
        .map(|n| (n, builder.store().entries_for_channel(n).unwrap()))
        .collect();

    let again = builder.rebuild_due_channels(&lineup.channels, at(12, 0, 0)).unwrap();
    assert!(again.is_empty());
    for n in lineup.numbers() {
        assert_eq!(builder.store().entries_for_channel(n).unwrap(), before[&n]);
    }
}

#[test]
fn rebuild_trigger_flips_after_build() {
    let (_, builder) = station();
    let store = builder.store();
    assert!(store.needs_rebuild(2, at(6, 0, 0)).unwrap());
    builder.rebuild_due_channels(&lineup().channels[..1], at(6, 0, 0)).unwrap();
    assert!(!store.needs_rebuild(2, at(6, 0, 0)).unwrap());
    // Once the day has aired the channel is due again.
    let day_end = store.last_end(2).unwrap().unwrap();
    assert!(store.needs_rebuild(2, day_end).unwrap());
}

#[test]
fn next_day_continues_after_overrun() {
    let (_, builder) = station();
    let lineup = lineup();
    let profiles = &lineup.channels[2..3];
    builder.rebuild_due_channels(profiles, at(6, 0, 0)).unwrap();
    let first_end = builder.store().last_end(4).unwrap().unwrap();

    builder.rebuild_due_channels(profiles, first_end).unwrap();
    let entries = builder.store().entries_for_channel(4).unwrap();
    assert_contiguous(&entries);
    assert!(entries.last().unwrap().end > first_end + TimeDelta::hours(12));
}

#[test]
fn episode_breaks_land_on_slot_boundaries() {
    let (_, builder) = station();
    builder.rebuild_due_channels(&lineup().channels[..1], at(6, 0, 0)).unwrap();
    let entries = builder.store().entries_for_channel(2).unwrap();

    for (i, e) in entries.iter().enumerate() {
        if e.content_ref != FILLER {
            continue;
        }
        // Break fillers close a slot: the next program starts on :00 or :30.
        if let Some(next) = entries.get(i + 1) {
            if next.content_ref.starts_with("/tv/") {
                use chrono::Timelike;
                assert_eq!(next.showtime.minute() % 30, 0, "{next:?}");
                assert_eq!(next.showtime.second(), 0, "{next:?}");
            }
        }
    }
}

#[test]
fn slot_map_switches_tags_in_the_evening() {
    let (_, builder) = station();
    builder.rebuild_due_channels(&lineup().channels[..1], at(6, 0, 0)).unwrap();
    let entries = builder.store().entries_for_channel(2).unwrap();

    let is_program = |e: &&ScheduleEntry| e.content_ref.starts_with("/tv/") || e.content_ref.starts_with("/movies/");
    let (evening, daytime): (Vec<_>, Vec<_>) = entries
        .iter()
        .filter(is_program)
        .partition(|e| e.showtime >= at(21, 0, 0) && e.showtime < at(0, 0, 0) + TimeDelta::days(1));
    assert!(!evening.is_empty());
    assert!(evening.iter().all(|e| !e.content_ref.starts_with("/tv/sitcom/")));
    assert!(daytime
        .iter()
        .filter(|e| e.showtime < at(21, 0, 0))
        .all(|e| e.content_ref.starts_with("/tv/sitcom/")));
}

// ── Chapters & breaks ────────────────────────────────────────────────────

#[test]
fn twenty_two_minute_episode_with_short_tail_is_one_block() {
    // 21:00 + 1:00 chapters: the one-minute tail merges into the first.
    let raw = [
        Chapter { index: 1, start: TimeDelta::zero(), end: TimeDelta::seconds(1260) },
        Chapter { index: 2, start: TimeDelta::seconds(1260), end: TimeDelta::seconds(1320) },
    ];
    let merged = chapters::segments(&raw);
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].index, 1);
    assert_eq!(merged[0].duration(), TimeDelta::minutes(22));

    let db = Database::open_in_memory().unwrap();
    let mut items = commercials();
    items.push(episode("/tv/x.mkv", "X", 1320, &[(0, 1260), (1260, 1320)], &["x"]));
    Catalog::new(db.clone()).import(&CatalogFile { items }).unwrap();
    let builder = ScheduleBuilder::new(&db, FILLER).with_seed(1);
    let mut profile = lineup().channels[0].clone();
    profile.tags = vec!["x".into()];
    profile.slots.clear();
    profile.run_until = NaiveTime::from_hms_opt(0, 30, 0);

    let mut rng = fastrand::Rng::with_seed(1);
    builder.build_channel(&profile, at(0, 0, 0), &mut rng).unwrap();
    let entries = builder.store().entries_for_channel(2).unwrap();
    assert_contiguous(&entries);
    assert_eq!(entries[0].content_ref, "/tv/x.mkv");
    assert_eq!(entries[0].runtime, TimeDelta::seconds(1321));
    assert!(entries[1..].iter().all(|e| e.content_ref != "/tv/x.mkv"));
    assert_eq!(entries.last().unwrap().end, at(0, 30, 0));
}

#[test]
fn every_break_closes_exactly_on_its_deadline() {
    let (_, builder) = station();
    builder.rebuild_due_channels(&lineup().channels[..1], at(6, 0, 0)).unwrap();
    let entries = builder.store().entries_for_channel(2).unwrap();

    let fillers: Vec<_> = entries.iter().filter(|e| e.content_ref == FILLER).collect();
    assert!(!fillers.is_empty());
    for f in fillers {
        use chrono::Timelike;
        // Each filler ends a slot, and no more than a minute is left to it
        // unless the commercials ran out.
        assert_eq!(f.end.second(), 0, "{f:?}");
        assert_eq!(f.end.minute() % 30, 0, "{f:?}");
    }
}

#[test]
fn filler_never_airs_as_a_commercial() {
    let (_, builder) = station();
    builder.rebuild_due_channels(&lineup().channels[..1], at(6, 0, 0)).unwrap();
    let entries = builder.store().entries_for_channel(2).unwrap();
    for (i, e) in entries.iter().enumerate() {
        if e.content_ref == FILLER {
            // A filler is always the last thing before a program.
            let next = entries.get(i + 1);
            assert!(next.is_none_or(|n| n.content_ref != FILLER && !n.content_ref.starts_with("/ads/")));
        }
    }
}

// ── Selection ────────────────────────────────────────────────────────────

#[test]
fn weighted_selection_does_not_starve() {
    let now = at(12, 0, 0);
    let items: Vec<ContentItem> = (0..4)
        .map(|i| {
            let mut r = record(&format!("/tv/{i}.mkv"), MediaDetails::Movie { year: None }, 600, &[]).item;
            r.last_played = Some(now - TimeDelta::hours(i + 1));
            r
        })
        .collect();

    let mut rng = fastrand::Rng::with_seed(99);
    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..4000 {
        let picked = select_weighted(&items, now, &mut rng).unwrap();
        *counts.entry(picked.filepath.clone()).or_default() += 1;
    }
    assert_eq!(counts.len(), 4, "{counts:?}");
    // The longest-rested item wins most often.
    assert!(counts["/tv/3.mkv"] > counts["/tv/0.mkv"]);
}

#[test]
fn picks_rotate_through_a_show() {
    let (db, builder) = station();
    builder.rebuild_due_channels(&lineup().channels[..1], at(6, 0, 0)).unwrap();
    let entries = builder.store().entries_for_channel(2).unwrap();
    let aired: std::collections::HashSet<_> = entries
        .iter()
        .filter(|e| e.content_ref.starts_with("/tv/sitcom/"))
        .map(|e| e.content_ref.clone())
        .collect();
    assert_eq!(aired.len(), 3);

    let catalog = Catalog::new(db);
    let e1 = catalog.get("/tv/sitcom/e1.mkv").unwrap().unwrap();
    assert_eq!(e1.last_played, Some(at(6, 0, 0)));
}

// ── Tuning ───────────────────────────────────────────────────────────────

#[test]
fn tune_in_mid_chapter_seeks_to_live_position() {
    let db = Database::open_in_memory().unwrap();
    Catalog::new(db.clone())
        .import(&CatalogFile {
            items: vec![episode("/tv/e.mkv", "E", 1320, &[(0, 300), (300, 1320)], &[])],
        })
        .unwrap();
    let store = ScheduleStore::new(db.clone());
    let live = ScheduleEntry::new(2, at(20, 8, 0), "/tv/e.mkv", Some(2), TimeDelta::seconds(1021));
    store.insert(&live).unwrap();

    let start = ChapterIndex::new(db.clone()).chapter_start("/tv/e.mkv", 2).unwrap();
    assert_eq!(compute_offset(&live, start, at(20, 8, 30)), TimeDelta::seconds(330));

    let clock = ManualClock::new(at(20, 8, 30));
    let (handle, rx) = tuner_channel();
    let player = FakePlayer::new(clock.clone(), Some(1320.0));
    let mut tuner = Synchronizer::new(&db, player, clock.clone(), rx, vec![2], 2).without_file_check();
    handle.shutdown();
    assert_eq!(tuner.cycle().unwrap(), Outcome::Shutdown);
    assert_eq!(tuner.player().seeks, vec![330.0]);
}

#[test]
fn tuner_follows_a_built_schedule_across_entries() {
    let (db, builder) = station();
    builder.rebuild_due_channels(&lineup().channels[1..2], at(0, 0, 0)).unwrap();
    let entries = builder.store().entries_for_channel(3).unwrap();

    let clock = ManualClock::new(at(0, 0, 0));
    let (_handle, rx) = tuner_channel();
    let player = FakePlayer::new(clock.clone(), Some(3600.0));
    let mut tuner = Synchronizer::new(&db, player, clock.clone(), rx, vec![3], 3).without_file_check();

    for expected in entries.iter().take(4) {
        assert_eq!(tuner.cycle().unwrap(), Outcome::Ended);
        let loaded = tuner.player().loaded.clone().unwrap();
        assert_eq!(loaded.to_string_lossy(), expected.content_ref);
        assert_eq!(clock.now(), expected.end);
    }
    let overlay = tuner.player().overlay.clone();
    // Fourth entry is a music video after the ident.
    assert!(overlay.is_some_and(|o| o.starts_with("Band ")));
}

#[test]
fn tuner_extends_the_schedule_once_it_runs_out() {
    let (db, builder) = station();
    let mut music = lineup().channels[1].clone();
    music.run_until = NaiveTime::from_hms_opt(0, 10, 0);
    builder.rebuild_due_channels(std::slice::from_ref(&music), at(0, 0, 0)).unwrap();
    let store = builder.store();
    let first_end = store.last_end(3).unwrap().unwrap();

    let clock = ManualClock::new(first_end + TimeDelta::seconds(1));
    let (_handle, rx) = tuner_channel();
    let player = FakePlayer::new(clock.clone(), Some(3600.0));
    let mut tuner = Synchronizer::new(&db, player, clock.clone(), rx, vec![3], 3)
        .without_file_check()
        .with_rebuilder(builder.clone(), vec![music]);

    assert_eq!(tuner.cycle().unwrap(), Outcome::Ended);
    assert!(tuner.player().loaded.is_some());
    assert_eq!(store.entries_for_channel(3).unwrap()[0].showtime, at(0, 0, 0));
    assert_contiguous(&store.entries_for_channel(3).unwrap());
    assert!(store.last_end(3).unwrap().unwrap() > first_end + TimeDelta::hours(23));
    assert!(!store.needs_rebuild(3, clock.now()).unwrap());
}

#[test]
fn channel_up_wraps_and_is_remembered() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("tuner.json");
    let (db, builder) = station();
    let lineup = lineup();
    builder.rebuild_due_channels(&lineup.channels, at(0, 0, 0)).unwrap();

    let clock = ManualClock::new(at(9, 0, 0));
    let (handle, rx) = tuner_channel();
    let player = FakePlayer::new(clock.clone(), Some(7200.0));
    let mut tuner = Synchronizer::new(&db, player, clock.clone(), rx, lineup.numbers(), 5)
        .without_file_check()
        .with_state_file(&state_file);

    handle.channel_up();
    assert_eq!(tuner.cycle().unwrap(), Outcome::ChannelChanged);
    assert_eq!(tuner.channel(), 2);
    assert_eq!(TunerState::load(&state_file).last_channel, Some(2));

    handle.channel_down();
    tuner.cycle().unwrap();
    assert_eq!(tuner.channel(), 5);
}
