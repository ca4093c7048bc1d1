use std::io::SeekFrom;

use cdda_paranoia::{
    MemoryDrive, Paranoia, ParanoiaCallback, ParanoiaConfig, ParanoiaMode, CD_FRAMEWORDS,
    MIN_READAHEAD,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

const FW: usize = CD_FRAMEWORDS;

fn disc(sectors: usize, seed: u64) -> Vec<i16> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..sectors * FW).map(|_| rng.random::<i16>()).collect()
}

/// Read `count` sectors from the cursor, collecting samples and events.
fn read_n(
    p: &mut Paranoia<MemoryDrive>,
    count: usize,
) -> (Vec<i16>, Vec<(i64, ParanoiaCallback)>) {
    let mut out = Vec::with_capacity(count * FW);
    let mut events = Vec::new();
    for _ in 0..count {
        let sector = p
            .read_sector(|pos, ev| events.push((pos, ev)), 20)
            .expect("read failed");
        assert_eq!(sector.len(), FW);
        out.extend_from_slice(sector);
    }
    (out, events)
}

fn has(events: &[(i64, ParanoiaCallback)], event: ParanoiaCallback) -> bool {
    events.iter().any(|&(_, ev)| ev == event)
}

#[test]
fn test_clean_disc_reads_exactly() {
    let truth = disc(200, 1);
    let mut p = Paranoia::new(MemoryDrive::new(0, truth.clone()));
    let (out, events) = read_n(&mut p, 200);
    assert!(out == truth, "output differs from the disc");
    assert!(!has(&events, ParanoiaCallback::Skip));
    assert!(has(&events, ParanoiaCallback::Read));
    assert!(has(&events, ParanoiaCallback::Verify));
    assert!(p.read_sector(|_, _| {}, 20).is_err());
}

#[test]
fn test_disc_not_starting_at_zero() {
    let truth = disc(8, 2);
    let mut p = Paranoia::new(MemoryDrive::new(100, truth.clone()));
    assert_eq!(p.cursor(), 100);
    let sectors: Vec<Vec<i16>> = p.iter().collect::<Result<_, _>>().expect("read failed");
    assert_eq!(sectors.len(), 8);
    assert!(sectors.concat() == truth);
}

#[test]
fn test_dropped_sample_is_repaired() {
    let truth = disc(60, 3);
    let drive = MemoryDrive::new(0, truth.clone()).with_filter(|req, words| {
        // lose one sample in the middle of the first request
        let at = 5 * FW + 300;
        if req.index == 0 && words.len() > at + 1 {
            words.copy_within(at + 1.., at);
            let last = words.len() - 1;
            words[last] = req.truth(req.word_begin() + words.len() as i64);
        }
        req.sectors
    });
    let mut p = Paranoia::new(drive);
    let (out, events) = read_n(&mut p, 60);
    assert!(out == truth, "output differs from the disc");

    // the clean read syncs to the damaged one at a one-sample offset
    let at = (5 * FW + 300) as i64;
    assert!(events.contains(&(at, ParanoiaCallback::FixupAtom)));
    // only one read was damaged, so the root never needed a repair
    assert!(!has(&events, ParanoiaCallback::FixupDropped));
    assert!(!has(&events, ParanoiaCallback::FixupDuplicated));
    assert!(!has(&events, ParanoiaCallback::Skip));
}

#[test]
fn test_short_read_is_recovered() {
    let truth = disc(60, 4);
    let drive = MemoryDrive::new(0, truth.clone()).with_filter(|req, words| {
        if req.index == 1 {
            words.fill(0);
            return req.sectors - 3;
        }
        req.sectors
    });
    let mut p = Paranoia::new(drive);
    let (out, events) = read_n(&mut p, 60);
    assert!(has(&events, ParanoiaCallback::ReadError));
    assert!(out == truth, "output differs from the disc");
}

#[test]
fn test_smallest_readahead_reads_exactly() {
    let truth = disc(120, 14);
    let config = ParanoiaConfig::default().with_readahead(MIN_READAHEAD);
    let mut p = Paranoia::with_config(MemoryDrive::new(0, truth.clone()), config)
        .expect("valid config");
    let (out, events) = read_n(&mut p, 120);
    assert!(out == truth, "output differs from the disc");
    assert!(!has(&events, ParanoiaCallback::Skip));
}

#[test]
fn test_readahead_below_floor_is_rejected() {
    let config = ParanoiaConfig::default().with_readahead(MIN_READAHEAD - 1);
    assert!(Paranoia::with_config(MemoryDrive::new(0, disc(4, 15)), config).is_err());
}

fn jitter_drive(truth: Vec<i16>, seed: u64) -> MemoryDrive {
    let mut rng = StdRng::seed_from_u64(seed);
    MemoryDrive::new(0, truth).with_filter(move |req, words| {
        let delta: i64 = rng.random_range(-4..=4);
        let base = req.word_begin() + delta;
        for (i, w) in words.iter_mut().enumerate() {
            *w = req.truth(base + i as i64);
        }
        req.sectors
    })
}

#[test]
fn test_jitter_is_corrected() {
    let truth = disc(200, 5);
    let mut p = Paranoia::new(jitter_drive(truth.clone(), 99));
    p.seek(SeekFrom::Start(10)).expect("seek failed");
    let (out, events) = read_n(&mut p, 40);
    assert!(!has(&events, ParanoiaCallback::Skip));

    let start = 10 * FW as i64;
    let shift = (-8..=8i64).find(|s| {
        let lo = (start + s) as usize;
        truth[lo..lo + out.len()] == out[..]
    });
    assert!(shift.is_some(), "output is not a contiguous window of the disc");
}

#[test]
fn test_reads_are_repeatable() {
    let truth = disc(80, 6);
    let mut a = Paranoia::new(jitter_drive(truth.clone(), 7));
    let mut b = Paranoia::new(jitter_drive(truth, 7));
    let (out_a, events_a) = read_n(&mut a, 50);
    let (out_b, events_b) = read_n(&mut b, 50);
    assert!(out_a == out_b);
    assert_eq!(events_a, events_b);
}

#[test]
fn test_delivery_is_monotonic() {
    let truth = disc(40, 8);
    let mut p = Paranoia::new(MemoryDrive::new(0, truth));
    let mut previous = 0;
    for sector in 0..40i64 {
        let samples = p.read_sector(|_, _| {}, 20).expect("read failed").to_vec();
        let begin = sector * FW as i64;
        assert_eq!(p.root_samples(begin, begin + FW as i64), Some(&samples[..]));
        let limit = p.returned_limit();
        assert!(limit >= begin);
        assert!(limit >= previous);
        previous = limit;
        if let Some((root_begin, _)) = p.root_range() {
            assert!(root_begin <= begin);
        }
    }
}

#[test]
fn test_garbage_drive_skips_and_finishes() {
    let mut rng = StdRng::seed_from_u64(9);
    let drive = MemoryDrive::new(0, vec![0; 20 * FW]).with_filter(move |req, words| {
        words.iter_mut().for_each(|w| *w = rng.random());
        req.sectors
    });
    let mut p = Paranoia::new(drive);
    let (out, events) = read_n(&mut p, 20);
    assert_eq!(out.len(), 20 * FW);
    assert!(has(&events, ParanoiaCallback::Skip));
    assert!(has(&events, ParanoiaCallback::Backoff));
}

#[test]
fn test_seek_resets_session() {
    let truth = disc(100, 10);
    let mut p = Paranoia::new(MemoryDrive::new(0, truth.clone()));
    read_n(&mut p, 3);
    assert!(p.root_range().is_some());

    assert_eq!(p.seek(SeekFrom::Start(50)).expect("seek failed"), 3);
    assert_eq!(p.cursor(), 50);
    assert_eq!(p.root_range(), None);
    assert_eq!(p.returned_limit(), 0);
    assert_eq!(p.fragment_count(), 0);

    let (out, _) = read_n(&mut p, 2);
    assert!(out[..] == truth[50 * FW..52 * FW]);

    assert!(p.seek(SeekFrom::End(1)).is_err());
    assert_eq!(p.cursor(), 52);
    assert_eq!(p.seek(SeekFrom::Current(-2)).expect("seek failed"), 52);
    assert_eq!(p.cursor(), 50);
}

#[test]
fn test_disabled_mode_passes_corruption_through() {
    let truth = disc(20, 11);
    let bad = 5 * FW as i64 + 10;
    let drive = MemoryDrive::new(0, truth.clone()).with_filter(move |req, words| {
        let idx = bad - req.word_begin();
        if (0..words.len() as i64).contains(&idx) {
            words[idx as usize] = words[idx as usize].wrapping_add(1);
        }
        req.sectors
    });
    let config = ParanoiaConfig::default().with_mode(ParanoiaMode::DISABLE);
    let mut p = Paranoia::with_config(drive, config).expect("valid config");
    let (out, events) = read_n(&mut p, 20);
    assert_eq!(out[bad as usize], truth[bad as usize].wrapping_add(1));
    assert_eq!(out[..bad as usize], truth[..bad as usize]);
    assert!(!has(&events, ParanoiaCallback::Verify));
}

#[test]
fn test_overlap_only_mode() {
    let truth = disc(60, 12);
    let mut p = Paranoia::new(MemoryDrive::new(0, truth.clone()));
    p.set_mode(ParanoiaMode::OVERLAP);
    let (out, events) = read_n(&mut p, 60);
    assert!(out == truth, "output differs from the disc");
    assert!(!has(&events, ParanoiaCallback::Skip));
}

#[test]
fn test_stored_callback_sees_events() {
    use std::sync::{Arc, Mutex};

    let truth = disc(30, 13);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut p = Paranoia::new(MemoryDrive::new(0, truth.clone()));
    p.set_callback(move |pos, ev| sink.lock().unwrap().push((pos, ev)));

    let first = p.read().expect("read failed").to_vec();
    assert!(first[..] == truth[..FW]);
    assert!(!seen.lock().unwrap().is_empty());

    p.clear_callback();
    let count = seen.lock().unwrap().len();
    p.read().expect("read failed");
    assert_eq!(seen.lock().unwrap().len(), count);
}
