use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use powerline::config::{
    AppConfig, JournalConfig, PlacementConfig, QualificationConfig, ReportingConfig,
};
use powerline::journal::JOURNAL_FILE;
use powerline::{MemoryTreeStore, NodeId, PlacementMethod, PowerLine, Side};

fn journal_config(name: &str) -> AppConfig {
    let data_dir = format!("target/test_powerline_{}_{}", name, std::process::id());
    let _ = std::fs::remove_dir_all(&data_dir);
    AppConfig {
        log_level: "info".to_string(),
        log_dir: "./logs".to_string(),
        log_file: "powerline.log".to_string(),
        use_json: false,
        rotation: "never".to_string(),
        enable_tracing: false,
        root_node_id: "ROOT".to_string(),
        placement: PlacementConfig::default(),
        qualification: QualificationConfig {
            max_cycles_per_window: Some(3),
            window_secs: 3600,
            ..Default::default()
        },
        journal: JournalConfig {
            enabled: true,
            data_dir,
        },
        reporting: ReportingConfig::default(),
    }
}

fn open(config: &AppConfig) -> PowerLine {
    PowerLine::open(config.clone(), Arc::new(MemoryTreeStore::new())).unwrap()
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 1, 8, 0, 0).unwrap()
}

fn id(s: &str) -> NodeId {
    NodeId::from(s)
}

/// Root plus five placed positions, four of them enrolled, with cycles paid
fn seed(engine: &PowerLine) {
    let root = id("ROOT");
    engine
        .enroll_at(&root, 1, PlacementMethod::Direct, t0())
        .unwrap();
    for _ in 0..5 {
        engine.place_prospect_at(&root, None, None, t0()).unwrap();
    }
    for (i, node) in ["ROOT_Left", "ROOT_Right", "ROOT_Left_Left", "ROOT_Left_Right"]
        .iter()
        .enumerate()
    {
        engine
            .enroll_at(&id(node), 100 + i as u64, PlacementMethod::Spillover, t0())
            .unwrap();
    }
    engine.set_active(&id("ROOT_Left_Right"), false).unwrap();

    engine
        .record_volume_event_at(&id("ROOT_Left_Left"), 1200, t0())
        .unwrap();
    engine
        .record_volume_event_at(&id("ROOT_Left_Right"), 700, t0())
        .unwrap();
    engine
        .record_volume_event_at(&id("ROOT_Right"), 900, t0())
        .unwrap();
    engine
        .record_volume_event_at(&id("ROOT_Right_Left"), 300, t0() + Duration::minutes(5))
        .unwrap();
}

#[test]
fn tc_reopen_restores_tree_and_ledger() {
    let config = journal_config("reopen");
    let engine = open(&config);
    seed(&engine);
    engine.verify_invariants().unwrap();

    let positions = engine.snapshot();
    let commissions = engine.commissions();
    assert!(!commissions.is_empty());
    drop(engine);

    let reopened = open(&config);
    assert_eq!(reopened.snapshot(), positions);
    assert_eq!(reopened.commissions(), commissions);
    reopened.verify_invariants().unwrap();

    // Promoter index comes back with the tree
    assert_eq!(
        reopened.find_by_promoter(102).map(|p| p.node_id),
        Some(id("ROOT_Left_Left"))
    );
    assert!(reopened
        .enroll(&id("ROOT_Right_Left"), 102, PlacementMethod::Spillover)
        .is_err());
    assert!(
        !reopened
            .get_position(&id("ROOT_Left_Right"))
            .unwrap()
            .occupant
            .unwrap()
            .is_active
    );
}

#[test]
fn tc_reopen_continues_numbering_and_cycles() {
    let config = journal_config("continue");
    let engine = open(&config);
    seed(&engine);
    let root_before = engine.root().unwrap();
    let commissions_before = engine.commissions().len();
    drop(engine);

    let engine = open(&config);
    let receipt = engine
        .place_prospect_at(&id("ROOT"), Some(Side::Right), None, t0())
        .unwrap();
    assert_eq!(receipt.position_number, 7);
    assert_eq!(receipt.node_id, id("ROOT_Right_Right"));

    // Still inside the recovered window: the cap carries over
    engine
        .record_volume_event_at(&receipt.node_id, 5000, t0() + Duration::minutes(10))
        .unwrap();
    let root = engine.root().unwrap();
    let expected_window = root_before.window.map(|w| w.window_start);
    assert_eq!(root.window.map(|w| w.window_start), expected_window);
    assert!(root.window.is_some_and(|w| w.cycles_in_window <= 3));

    let seqs: Vec<u64> = engine.commissions().iter().map(|c| c.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    assert!(seqs.len() >= commissions_before);

    let positions = engine.snapshot();
    let commissions = engine.commissions();
    drop(engine);

    let engine = open(&config);
    assert_eq!(engine.snapshot(), positions);
    assert_eq!(engine.commissions(), commissions);
    engine.verify_invariants().unwrap();
}

#[test]
fn tc_torn_tail_is_discarded_on_reopen() {
    let config = journal_config("torn");
    let engine = open(&config);
    seed(&engine);
    let positions = engine.snapshot();
    drop(engine);

    let path = std::path::Path::new(&config.journal.data_dir).join(JOURNAL_FILE);
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0x14, 0x00, 0x00, 0x00, 0x01, 0x02, 0x03]).unwrap();
    drop(file);

    let engine = open(&config);
    assert_eq!(engine.snapshot(), positions);

    // Writes after the truncated tail survive another reopen
    let receipt = engine.place_prospect(&id("ROOT"), None, None).unwrap();
    drop(engine);
    let engine = open(&config);
    assert!(engine.get_position(&receipt.node_id).is_ok());
    engine.verify_invariants().unwrap();
}

#[test]
fn tc_in_memory_engine_ignores_journal_dir() {
    let mut config = journal_config("disabled");
    config.journal.enabled = false;
    let engine = open(&config);
    engine.place_prospect(&id("ROOT"), None, None).unwrap();
    assert!(!std::path::Path::new(&config.journal.data_dir).exists());
}

#[test]
fn tc_placement_record_size_is_independent_of_depth() {
    let config = journal_config("deep_chain");
    let engine = open(&config);
    let path = std::path::Path::new(&config.journal.data_dir).join(JOURNAL_FILE);
    let journal_len = || std::fs::metadata(&path).unwrap().len();

    let mut prev = id("ROOT");
    let mut sizes = Vec::new();
    for _ in 0..300 {
        let before = journal_len();
        let receipt = engine.place_prospect_at(&prev, None, None, t0()).unwrap();
        sizes.push(journal_len() - before);
        prev = receipt.node_id;
    }
    assert!(sizes.iter().all(|&size| size == sizes[0]), "{sizes:?}");
    drop(engine);

    let engine = open(&config);
    assert_eq!(engine.get_position(&prev).unwrap().level(), 300);
    assert_eq!(engine.snapshot().len(), 301);
}
