use std::fs::{self, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use ringtrace::layout::TraceFileHeader;
use ringtrace::region::HeapArena;
use ringtrace::tail::{Emitter, Step, TailStatus};
use ringtrace::{
    qtrace, CatControl, FileOptions, FileTail, Identity, OutputOptions, ReadMode, SizeSpec,
    TailControl, TraceConfig, TraceFile, TraceHandle, WriterMode,
};
use tempfile::tempdir;

/// Encoded size of a message with one `u32` parameter.
const U32_MSG: usize = 13 + 4;

fn small_file(path: &Path) -> TraceFile {
    let options = FileOptions { sizes: SizeSpec::uniform(1), ..Default::default() };
    TraceFile::create(path, &options).unwrap()
}

fn texts(output: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(output)
        .lines()
        .filter_map(|l| {
            let start = l.find('"')?;
            let end = l.rfind('"')?;
            (end > start).then(|| l[start + 1..end].to_string())
        })
        .collect()
}

fn numbers(texts: &[String], prefix: &str) -> Vec<u32> {
    texts
        .iter()
        .filter_map(|t| t.strip_prefix(prefix)?.parse().ok())
        .collect()
}

/// Overwrites bytes at `within` of the `index`th message of level 0.
fn overwrite_message(tf: &TraceFile, index: usize, within: usize, bytes: &[u8]) {
    let (offset, _) = tf.header().level_range(0);
    let at = offset + 4 + index * U32_MSG + within;
    let file = OpenOptions::new().write(true).open(tf.path()).unwrap();
    file.write_all_at(bytes, at as u64).unwrap();
}

/// Overwrites the id of the `index`th message of level 0.
fn corrupt_id(tf: &TraceFile, index: usize) {
    overwrite_message(tf, index, 8, &0x00ff_fff0u32.to_ne_bytes());
}

fn write_header(path: &Path, header: &TraceFileHeader) {
    let arena = HeapArena::new(TraceFileHeader::SIZE).unwrap();
    header.store(&arena.region());
    let file = OpenOptions::new().write(true).open(path).unwrap();
    file.write_all_at(arena.as_slice(), 0).unwrap();
}

fn drain(tail: &mut FileTail, emitter: &mut Emitter<Vec<u8>>) {
    for _ in 0..3000 {
        tail.tail(u64::MAX, emitter).unwrap();
    }
}

#[test]
fn test_corruption_is_reported_once_and_level_recovers() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("corrupt.qt");
    let mut tf = small_file(&path);
    for i in 0..10u32 {
        qtrace!(tf, 0, "n {}", i);
    }
    corrupt_id(&tf, 4);

    let options = OutputOptions::default();
    let mut tail = FileTail::open(&path, ReadMode::Tail, false, &options).unwrap();
    let mut emitter = Emitter::new(Vec::new(), options);
    drain(&mut tail, &mut emitter);

    let output = String::from_utf8(emitter.get_ref().clone()).unwrap();
    assert_eq!(numbers(&texts(output.as_bytes()), "n "), vec![0, 1, 2, 3]);
    assert_eq!(output.matches("---------- corruption detected in").count(), 1);
    assert!(output.contains("log level: 0\n"));
    assert!(output.contains(&format!("reason: invalid message id: {}", 0x00ff_fff0u32)));
    assert!(output.contains(
        "---------- resetting log buffer 0 of corrupt.qt due to corruption - potential message loss"
    ));

    // once the writer has come around, reading resumes from the start
    for i in 100..300u32 {
        qtrace!(tf, 0, "n {}", i);
    }
    drain(&mut tail, &mut emitter);
    let output = String::from_utf8(emitter.into_inner()).unwrap();
    assert_eq!(output.matches("---------- corruption detected in").count(), 1);
    let after: Vec<u32> = numbers(&texts(output.as_bytes()), "n ").into_iter().skip(4).collect();
    assert!(!after.is_empty());
    assert_eq!(*after.last().unwrap(), 299);
    assert!(after.windows(2).all(|w| w[1] == w[0] + 1));
}

#[test]
fn test_length_byte_mismatch_is_reported_and_level_resets() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("length.qt");
    let mut tf = small_file(&path);
    for i in 0..10u32 {
        qtrace!(tf, 0, "n {}", i);
    }
    // the length byte closes the message: tsc, id, one u32
    overwrite_message(&tf, 4, 16, &[99]);

    let options = OutputOptions::default();
    let mut tail = FileTail::open(&path, ReadMode::Tail, false, &options).unwrap();
    let mut emitter = Emitter::new(Vec::new(), options);
    drain(&mut tail, &mut emitter);

    let output = String::from_utf8(emitter.get_ref().clone()).unwrap();
    assert_eq!(numbers(&texts(output.as_bytes()), "n "), vec![0, 1, 2, 3]);
    assert_eq!(output.matches("---------- corruption detected in").count(), 1);
    assert!(output.contains("reason: invalid length: 99 (expected: 16)\n"));
    assert_eq!(output.matches("---------- resetting log buffer 0 of length.qt").count(), 1);

    for i in 100..300u32 {
        qtrace!(tf, 0, "n {}", i);
    }
    drain(&mut tail, &mut emitter);
    let output = String::from_utf8(emitter.into_inner()).unwrap();
    assert_eq!(output.matches("---------- corruption detected in").count(), 1);
    let after: Vec<u32> = numbers(&texts(output.as_bytes()), "n ").into_iter().skip(4).collect();
    assert_eq!(after.last(), Some(&299));
    assert!(after.windows(2).all(|w| w[1] == w[0] + 1));
}

#[test]
fn test_cat_keeps_printing_after_a_file_fails() {
    let dir = tempdir().unwrap();
    let bad = dir.path().join("bad.qt");
    let good = dir.path().join("good.qt");
    let mut tb = small_file(&bad);
    let mut tg = small_file(&good);
    for i in 0..10u32 {
        qtrace!(tb, 0, "n {}", i);
        qtrace!(tg, 0, "g {}", i);
    }

    // opened before calibration completes, then found to be unreadable
    let header = tb.header();
    write_header(&bad, &TraceFileHeader { monotime1: header.monotime0, ..header });
    let mut control = CatControl::new(&[&bad, &good], OutputOptions::default(), Vec::new()).unwrap();
    assert_eq!(control.files()[0].status(), TailStatus::Initializing);
    write_header(&bad, &TraceFileHeader { version: 1, ..header });

    assert!(!control.run().unwrap());
    assert!(control.files()[0].is_aborted());
    assert!(!control.files()[1].is_aborted());
    let texts = texts(&control.into_output());
    assert!(numbers(&texts, "n ").is_empty());
    assert_eq!(numbers(&texts, "g "), (0..10).collect::<Vec<_>>());
}

#[test]
fn test_cat_aborts_corrupt_file_only() {
    let dir = tempdir().unwrap();
    let bad = dir.path().join("bad.qt");
    let good = dir.path().join("good.qt");
    let mut tb = small_file(&bad);
    let mut tg = small_file(&good);
    for i in 0..10u32 {
        qtrace!(tb, 0, "n {}", i);
        qtrace!(tg, 0, "g {}", i);
    }
    corrupt_id(&tb, 4);

    let mut control = CatControl::new(&[&bad, &good], OutputOptions::default(), Vec::new()).unwrap();
    assert!(!control.run().unwrap());
    assert!(control.files()[0].is_aborted());
    assert!(!control.files()[1].is_aborted());

    let output = String::from_utf8(control.into_output()).unwrap();
    let texts = texts(output.as_bytes());
    assert_eq!(numbers(&texts, "n "), vec![0, 1, 2, 3]);
    assert_eq!(numbers(&texts, "g "), (0..10).collect::<Vec<_>>());
    assert!(output.contains(&format!("---------- aborting {} due to corruption", bad.display())));
    assert!(!output.contains("resetting log buffer"));
}

#[test]
fn test_tail_starts_at_newest_message() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("skip.qt");
    let mut tf = small_file(&path);
    for i in 0..5u32 {
        qtrace!(tf, 1, "old {}", i);
    }
    let options = OutputOptions::default();
    let mut tail = FileTail::open(&path, ReadMode::Tail, true, &options).unwrap();
    let mut emitter = Emitter::new(Vec::new(), options);
    assert!(!tail.tail(u64::MAX, &mut emitter).unwrap());

    qtrace!(tf, 1, "new {}", 1u32);
    assert!(tail.tail(u64::MAX, &mut emitter).unwrap());
    assert_eq!(texts(&emitter.into_inner()), vec!["new 1"]);
}

#[test]
fn test_future_messages_wait_for_the_clock() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("future.qt");
    let mut tf = small_file(&path);
    let options = OutputOptions::default();
    let mut tail = FileTail::open(&path, ReadMode::Tail, true, &options).unwrap();
    let mut emitter = Emitter::new(Vec::new(), options);

    qtrace!(tf, 0, "later");
    let (tsc, _) = tail.next_tsc().unwrap().unwrap();
    assert!(!tail.tail(tsc - 1, &mut emitter).unwrap());
    assert!(tail.tail(tsc + 1, &mut emitter).unwrap());
    assert_eq!(texts(&emitter.into_inner()), vec!["later"]);
}

#[test]
fn test_status_transitions() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("status.qt");
    let _tf = small_file(&path);
    let mut tail = FileTail::open(&path, ReadMode::Tail, true, &OutputOptions::default()).unwrap();
    assert_eq!(tail.status(), TailStatus::Active);

    // a modification alone never triggers a re-open
    tail.transition(TailStatus::ReinitReady);
    assert_eq!(tail.status(), TailStatus::Active);

    tail.transition(TailStatus::DeletePending);
    assert_eq!(tail.status(), TailStatus::DeletePending);
    assert!(tail.next_tsc().unwrap().is_none());
    assert!(!tail.is_mapped());

    tail.transition(TailStatus::ReinitPending);
    tail.transition(TailStatus::ReinitReady);
    assert_eq!(tail.status(), TailStatus::ReinitReady);
    assert!(tail.next_tsc().unwrap().is_none());
    assert_eq!(tail.status(), TailStatus::Active);
    assert!(tail.is_mapped());
}

fn step_until(control: &mut TailControl<Vec<u8>>, done: impl Fn(&[String]) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !done(&texts(control.output())) {
        assert!(Instant::now() < deadline, "timed out; got {:?}", texts(control.output()));
        control.step().unwrap();
    }
}

#[test]
fn test_follows_writer_restart_and_deletion() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("follow.qt");
    let mut tf = small_file(&path);
    let mut control = TailControl::new(&[&path], OutputOptions::default(), Vec::new()).unwrap();

    let writer_path = path.clone();
    let writer = thread::spawn(move || {
        for i in 0..20u32 {
            qtrace!(tf, 0, "a {}", i);
        }
        // a restarting writer rotates the old file away and starts afresh
        let mut fresh = small_file(&writer_path);
        for i in 0..20u32 {
            qtrace!(fresh, 0, "b {}", i);
        }
    });

    step_until(&mut control, |t| t.len() >= 40);
    writer.join().unwrap();
    let texts = texts(control.output());
    assert_eq!(numbers(&texts, "a "), (0..20).collect::<Vec<_>>());
    assert_eq!(numbers(&texts, "b "), (0..20).collect::<Vec<_>>());
    assert!(texts[..20].iter().all(|t| t.starts_with("a ")));
    assert!(path.with_extension("qt.1").exists());

    fs::remove_file(&path).unwrap();
    let deadline = Instant::now() + Duration::from_secs(30);
    while control.step().unwrap() != Step::Done {
        assert!(Instant::now() < deadline);
    }
    assert_eq!(control.files()[0].status(), TailStatus::DeletePending);
    assert!(!control.had_failures());
}

#[test]
fn test_concurrent_writers_are_merged() {
    const WRITERS: u32 = 4;
    const MESSAGES: u32 = 200;

    let dir = tempdir().unwrap();
    let handle = TraceHandle::initialize(
        TraceConfig::new("merge.qt").dir(dir.path()).mode(WriterMode::PerIdentity),
    )
    .unwrap();
    let files: Vec<TraceFile> = (0..WRITERS)
        .map(|w| handle.trace_file(&Identity::new(format!("w{}-", w))).unwrap())
        .collect();
    let paths: Vec<_> = files.iter().map(|f| f.path().to_path_buf()).collect();
    let mut control = TailControl::new(&paths, OutputOptions::default(), Vec::new()).unwrap();

    let writers: Vec<_> = files
        .into_iter()
        .enumerate()
        .map(|(w, mut tf)| {
            thread::spawn(move || {
                for i in 0..MESSAGES {
                    qtrace!(tf, (i % 4) as usize, "w{} s{}", w as u32, i);
                }
            })
        })
        .collect();

    step_until(&mut control, |t| t.len() >= (WRITERS * MESSAGES) as usize);
    for writer in writers {
        writer.join().unwrap();
    }

    let texts = texts(control.output());
    for w in 0..WRITERS {
        let seq = numbers(&texts, &format!("w{} s", w));
        assert_eq!(seq, (0..MESSAGES).collect::<Vec<_>>(), "writer {}", w);
    }
    let names: Vec<String> = String::from_utf8_lossy(control.output())
        .lines()
        .map(|l| l.split_whitespace().nth(3).unwrap().to_string())
        .collect();
    assert!(names.iter().all(|n| n.ends_with("merge.qt") && n.starts_with('w')));
}

#[test]
fn test_live_merge_across_wrapping_levels_stays_ordered() {
    const MESSAGES: u32 = 2000;

    let dir = tempdir().unwrap();
    let handle = TraceHandle::initialize(
        TraceConfig::new("wrap.qt")
            .dir(dir.path())
            .sizes(SizeSpec::uniform(1))
            .mode(WriterMode::PerIdentity),
    )
    .unwrap();
    let files: Vec<TraceFile> = (0..2)
        .map(|w| handle.trace_file(&Identity::new(format!("e{}-", w))).unwrap())
        .collect();
    let paths: Vec<_> = files.iter().map(|f| f.path().to_path_buf()).collect();
    let options = OutputOptions { tsc: true, ..Default::default() };
    let mut control = TailControl::new(&paths, options, Vec::new()).unwrap();

    let writers: Vec<_> = files
        .into_iter()
        .enumerate()
        .map(|(w, mut tf)| {
            thread::spawn(move || {
                for i in 0..MESSAGES {
                    qtrace!(tf, (i % 10) as usize, "e{} s{}", w as u32, i);
                    if i % 8 == 7 {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
            })
        })
        .collect();

    let last = MESSAGES - 1;
    step_until(&mut control, |t| {
        (0..2).all(|w| numbers(t, &format!("e{} s", w)).last() == Some(&last))
    });
    for writer in writers {
        writer.join().unwrap();
    }

    let output = String::from_utf8_lossy(control.output()).into_owned();
    assert!(!output.contains("corruption detected"), "{}", output);
    let stamps: Vec<u64> = output
        .lines()
        .map(|l| {
            let column = l.split_whitespace().nth(3).unwrap();
            u64::from_str_radix(column.trim_start_matches("0x"), 16).unwrap()
        })
        .collect();
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]));

    let texts = texts(control.output());
    for w in 0..2 {
        let seq = numbers(&texts, &format!("e{} s", w));
        assert!(seq.windows(2).all(|p| p[0] < p[1]), "writer {}", w);
        // the reader kept pace although every level wrapped several times
        assert!(seq.len() as u32 > MESSAGES / 2, "writer {} kept {}", w, seq.len());
    }
}
