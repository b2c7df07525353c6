use tempfile::TempDir;

use romba::{Combiner, Dat, Game, Result, Rom, RomDb, RombaError};

const CRC_A: &str = "e43166b9";
const MD5_A: &str = "43ee6acc0c173048f47826307c0a262e";
const MD5_B: &str = "36ecf1371d3391c06c16f751431c932b";
const SHA1_B: &str = "80353cb168dc5d7cc1dce57971f4ea2640a50ac4";

fn h(s: &str) -> Vec<u8> {
    hex::decode(s).unwrap()
}

/// The partial rom of scenario S1: crc + md5, no sha1.
fn rom_a() -> Rom {
    Rom {
        name: "a.bin".to_owned(),
        size: 819200,
        crc: Some(h(CRC_A)),
        md5: Some(h(MD5_A)),
        ..Rom::default()
    }
}

/// The fully hashed rom of scenario S2.
fn rom_b() -> Rom {
    Rom {
        name: "b.bin".to_owned(),
        size: 512,
        md5: Some(h(MD5_B)),
        sha1: Some(h(SHA1_B)),
        ..Rom::default()
    }
}

fn dat_with(name: &str, roms: Vec<Rom>) -> Dat {
    Dat {
        name: name.to_owned(),
        description: format!("{} description", name),
        games: vec![Game {
            name: format!("{} game", name),
            roms,
            ..Game::default()
        }],
        ..Dat::default()
    }
}

fn dat_key(n: u8) -> Vec<u8> {
    vec![n; 20]
}

#[test]
fn index_dat_requires_sha1() {
    let dir = TempDir::new().unwrap();
    let db = RomDb::open(dir.path()).unwrap();
    let dat = dat_with("d", vec![rom_a()]);
    assert!(matches!(db.index_dat(&dat, None), Err(RombaError::Sha1Missing)));
    assert!(matches!(
        db.index_dat(&dat, Some(&[1, 2, 3])),
        Err(RombaError::Sha1Missing)
    ));
}

#[test]
fn get_dat_round_trips_structurally() {
    let dir = TempDir::new().unwrap();
    let db = RomDb::open(dir.path()).unwrap();
    let dat = dat_with("round", vec![rom_a(), rom_b()]);
    db.index_dat(&dat, Some(&dat_key(1))).unwrap();

    let mut expected = dat;
    expected.generation = db.generation();
    assert_eq!(db.get_dat(&dat_key(1)).unwrap(), Some(expected));
    assert_eq!(db.get_dat(&dat_key(2)).unwrap(), None);
}

// S1: a partial rom with no recorded sha1 mapping completes to nothing.
#[test]
fn complete_rom_without_mapping() {
    let dir = TempDir::new().unwrap();
    let db = RomDb::open(dir.path()).unwrap();
    db.index_dat(&dat_with("d1", vec![rom_a()]), Some(&dat_key(1))).unwrap();

    let mut partial = Rom {
        name: "a.bin".to_owned(),
        size: 819200,
        crc: Some(h(CRC_A)),
        ..Rom::default()
    };
    let alternates = db.complete_rom(&mut partial).unwrap();
    assert_eq!(partial.sha1, None);
    assert!(alternates.is_empty());
}

// S2: every present hash subset finds the dat, and md5∥size completes.
#[test]
fn lookup_by_any_hash_and_complete() {
    let dir = TempDir::new().unwrap();
    let db = RomDb::open(dir.path()).unwrap();
    let dat = dat_with("d1", vec![rom_a(), rom_b()]);
    db.index_dat(&dat, Some(&dat_key(1))).unwrap();

    let mut expected = dat;
    expected.generation = db.generation();

    let by_sha1 = Rom {
        size: 512,
        sha1: Some(h(SHA1_B)),
        ..Rom::default()
    };
    assert_eq!(db.dats_for_rom(&by_sha1).unwrap(), vec![expected.clone()]);

    let by_md5 = Rom {
        size: 512,
        md5: Some(h(MD5_B)),
        ..Rom::default()
    };
    assert_eq!(db.dats_for_rom(&by_md5).unwrap(), vec![expected.clone()]);

    let by_crc = Rom {
        size: 819200,
        crc: Some(h(CRC_A)),
        ..Rom::default()
    };
    assert_eq!(db.dats_for_rom(&by_crc).unwrap(), vec![expected]);

    let mut partial = Rom {
        size: 512,
        md5: Some(h(MD5_B)),
        ..Rom::default()
    };
    let alternates = db.complete_rom(&mut partial).unwrap();
    assert_eq!(partial.sha1, Some(h(SHA1_B)));
    assert!(alternates.is_empty());
}

// S3: orphan then re-index; the dat comes back exactly once at the new
// generation.
#[test]
fn reindex_after_orphan() {
    let dir = TempDir::new().unwrap();
    let db = RomDb::open(dir.path()).unwrap();
    let dat = dat_with("d1", vec![rom_b()]);

    db.index_dat(&dat, Some(&dat_key(1))).unwrap();
    db.orphan_dats().unwrap();

    // invariant 4: nothing is current between orphan and re-index
    let probe = Rom {
        size: 512,
        sha1: Some(h(SHA1_B)),
        ..Rom::default()
    };
    assert!(db.dats_for_rom(&probe).unwrap().is_empty());

    db.index_dat(&dat, Some(&dat_key(1))).unwrap();

    let found = db.dats_for_rom(&probe).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].generation, db.generation());
    assert_eq!(found[0].name, "d1");
}

// S4: two dats sharing a rom come back ordered by their dat sha1 bytes.
#[test]
fn shared_rom_orders_by_dat_sha1() {
    let dir = TempDir::new().unwrap();
    let db = RomDb::open(dir.path()).unwrap();

    // index under the larger key first to prove ordering is not insertion
    db.index_dat(&dat_with("late", vec![rom_b()]), Some(&dat_key(9))).unwrap();
    db.index_dat(&dat_with("early", vec![rom_b()]), Some(&dat_key(3))).unwrap();

    let probe = Rom {
        size: 512,
        sha1: Some(h(SHA1_B)),
        ..Rom::default()
    };
    let found = db.dats_for_rom(&probe).unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].name, "early");
    assert_eq!(found[1].name, "late");
}

// S6: colliding crc+size with two different sha1s.
#[test]
fn complete_rom_reports_collisions() {
    let dir = TempDir::new().unwrap();
    let db = RomDb::open(dir.path()).unwrap();

    let sha1_x = vec![0xaa; 20];
    let sha1_y = vec![0xbb; 20];
    for sha1 in [&sha1_x, &sha1_y] {
        db.index_rom(&Rom {
            name: "c.bin".to_owned(),
            size: 4096,
            crc: Some(h("01020304")),
            sha1: Some(sha1.clone()),
            ..Rom::default()
        })
        .unwrap();
    }

    let mut partial = Rom {
        size: 4096,
        crc: Some(h("01020304")),
        ..Rom::default()
    };
    let alternates = db.complete_rom(&mut partial).unwrap();

    let chosen = partial.sha1.clone().unwrap();
    assert_eq!(alternates.len(), 1);
    let alternate = alternates[0].sha1.clone().unwrap();
    assert_ne!(chosen, alternate);
    let mut both = vec![chosen, alternate];
    both.sort();
    assert_eq!(both, vec![sha1_x, sha1_y]);
}

#[test]
fn index_rom_without_sha1_stages_nothing() {
    let dir = TempDir::new().unwrap();
    let db = RomDb::open(dir.path()).unwrap();
    db.index_rom(&rom_a()).unwrap();

    let mut partial = Rom {
        size: 819200,
        crc: Some(h(CRC_A)),
        ..Rom::default()
    };
    db.complete_rom(&mut partial).unwrap();
    assert_eq!(partial.sha1, None);
}

#[test]
fn resolve_hash_by_length() {
    let dir = TempDir::new().unwrap();
    let db = RomDb::open(dir.path()).unwrap();
    let rom = Rom {
        name: "r".to_owned(),
        size: 99,
        crc: Some(h("cafebabe")),
        md5: Some(h(MD5_A)),
        sha1: Some(h(SHA1_B)),
        ..Rom::default()
    };
    db.index_rom(&rom).unwrap();

    assert_eq!(db.resolve_hash(&h("cafebabe")).unwrap(), vec![h(SHA1_B)]);
    assert_eq!(db.resolve_hash(&h(MD5_A)).unwrap(), vec![h(SHA1_B)]);
    assert_eq!(db.resolve_hash(&h(SHA1_B)).unwrap(), vec![h(SHA1_B)]);
    assert!(matches!(
        db.resolve_hash(&[0; 5]),
        Err(RombaError::UnknownHashSize(5))
    ));
}

#[test]
fn filtered_dats_partition_across_generations() {
    let dir = TempDir::new().unwrap();
    let db = RomDb::open(dir.path()).unwrap();

    db.index_dat(&dat_with("old", vec![rom_b()]), Some(&dat_key(1))).unwrap();
    db.orphan_dats().unwrap();
    db.index_dat(&dat_with("new", vec![rom_b()]), Some(&dat_key(2))).unwrap();

    let probe = Rom {
        size: 512,
        sha1: Some(h(SHA1_B)),
        ..Rom::default()
    };
    let current = db.generation();
    let (accepted, rejected) = db
        .filtered_dats_for_rom(&probe, |dat| dat.generation == current)
        .unwrap();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].name, "new");
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].name, "old");
}

struct CollectingCombiner {
    roms: Vec<Rom>,
    fail_after: Option<usize>,
}

impl Combiner for CollectingCombiner {
    fn declare(&mut self, rom: &Rom) -> Result<()> {
        if self.fail_after == Some(self.roms.len()) {
            return Err(RombaError::Msg("combiner full".to_owned()));
        }
        self.roms.push(rom.clone());
        Ok(())
    }
}

#[test]
fn join_crc_md5_streams_reconstructed_roms() {
    let dir = TempDir::new().unwrap();
    let db = RomDb::open(dir.path()).unwrap();
    let rom = Rom {
        name: "r".to_owned(),
        size: 77,
        crc: Some(h("cafebabe")),
        md5: Some(h(MD5_A)),
        sha1: Some(h(SHA1_B)),
        ..Rom::default()
    };
    db.index_rom(&rom).unwrap();

    let mut combiner = CollectingCombiner {
        roms: Vec::new(),
        fail_after: None,
    };
    db.join_crc_md5(&mut combiner).unwrap();

    assert_eq!(combiner.roms.len(), 2);
    for declared in &combiner.roms {
        assert_eq!(declared.size, 77);
        assert_eq!(declared.sha1, Some(h(SHA1_B)));
    }
    assert!(combiner.roms.iter().any(|r| r.crc == Some(h("cafebabe"))));
    assert!(combiner.roms.iter().any(|r| r.md5 == Some(h(MD5_A))));

    // a declare error aborts the iteration
    let mut failing = CollectingCombiner {
        roms: Vec::new(),
        fail_after: Some(1),
    };
    assert!(db.join_crc_md5(&mut failing).is_err());
}

#[test]
fn sweep_removes_aged_dats_and_index_rows() {
    let dir = TempDir::new().unwrap();
    let db = RomDb::open(dir.path()).unwrap();

    db.orphan_dats().unwrap();
    db.index_dat(&dat_with("doomed", vec![rom_b()]), Some(&dat_key(1))).unwrap();

    // not old enough yet: generation lag protects the last generation
    db.orphan_dats().unwrap();
    assert_eq!(db.sweep_orphans().unwrap(), 0);
    assert!(db.get_dat(&dat_key(1)).unwrap().is_some());

    db.orphan_dats().unwrap();
    assert_eq!(db.sweep_orphans().unwrap(), 1);
    assert_eq!(db.get_dat(&dat_key(1)).unwrap(), None);
    assert_eq!(db.num_roms(), 0);

    let probe = Rom {
        size: 512,
        sha1: Some(h(SHA1_B)),
        ..Rom::default()
    };
    let (accepted, rejected) = db.filtered_dats_for_rom(&probe, |_| true).unwrap();
    assert!(accepted.is_empty() && rejected.is_empty());
}

#[test]
fn generation_and_counts_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let db = RomDb::open(dir.path()).unwrap();
    db.orphan_dats().unwrap();
    db.orphan_dats().unwrap();
    db.index_dat(&dat_with("d", vec![rom_a(), rom_b()]), Some(&dat_key(1))).unwrap();
    let roms_before = db.num_roms();
    assert!(roms_before > 0);
    db.close().unwrap();

    let db = RomDb::open(dir.path()).unwrap();
    assert_eq!(db.generation(), 2);
    assert_eq!(db.num_roms(), roms_before);

    let probe = Rom {
        size: 512,
        sha1: Some(h(SHA1_B)),
        ..Rom::default()
    };
    assert_eq!(db.dats_for_rom(&probe).unwrap().len(), 1);
}

#[test]
fn batch_accumulates_and_flushes() {
    let dir = TempDir::new().unwrap();
    let db = RomDb::open(dir.path()).unwrap();

    let mut batch = db.start_batch();
    batch.index_dat(&dat_with("one", vec![rom_a()]), Some(&dat_key(1))).unwrap();
    batch.index_dat(&dat_with("two", vec![rom_b()]), Some(&dat_key(2))).unwrap();
    assert!(batch.size() > 0);

    // nothing visible before flush
    assert_eq!(db.get_dat(&dat_key(1)).unwrap(), None);

    batch.flush().unwrap();
    assert!(db.get_dat(&dat_key(1)).unwrap().is_some());
    assert!(db.get_dat(&dat_key(2)).unwrap().is_some());

    batch.close().unwrap();
}

#[test]
fn debug_get_reports_all_hash_sizes() {
    let dir = TempDir::new().unwrap();
    let db = RomDb::open(dir.path()).unwrap();
    db.index_dat(&dat_with("d", vec![rom_a(), rom_b()]), Some(&dat_key(1))).unwrap();

    let by_sha1 = db.debug_get(&h(SHA1_B), -1).unwrap();
    assert!(by_sha1.contains("sha1_db"));
    assert!(by_sha1.contains(&hex::encode(dat_key(1))));

    let by_crc = db.debug_get(&h(CRC_A), 819200).unwrap();
    assert!(by_crc.contains("crc_db"));
    assert!(by_crc.contains(&hex::encode(dat_key(1))));

    let by_md5 = db.debug_get(&h(MD5_B), -1).unwrap();
    assert!(by_md5.contains("md5_db"));

    assert!(matches!(
        db.debug_get(&[0; 3], -1),
        Err(RombaError::UnknownHashSize(3))
    ));
}
