/// This fuzzer simulates 3 sites editing one document. Each round:
///
/// - Every site makes a handful of random local changes, keeping its own
///   operations in order.
/// - Every site receives the other sites' operations, with the streams
///   interleaved at random (per-site order preserved, as the per-peer FIFO
///   queues guarantee in the real fabric).
/// - All three documents must be identical afterwards.
///
/// Any viable CRDT should be able to run this test indefinitely.
use rand::prelude::*;
use tandem::atom::Atom;
use tandem::document::Document;
use tandem::range::Point;

#[derive(Clone)]
enum Op {
    Insert(Atom),
    Delete(Atom),
}

fn random_str(len: usize, rng: &mut SmallRng) -> String {
    let mut str = String::new();
    let alphabet: Vec<char> = "abcdefghijklmnop_\n".chars().collect();
    for _ in 0..len {
        str.push(alphabet[rng.gen_range(0..alphabet.len())]);
    }
    str
}

/// Maps a flat char index into (row, column) coordinates of `text`.
fn point_at(text: &str, index: usize) -> Point {
    let mut row = 0;
    let mut column = 0;
    for c in text.chars().take(index) {
        if c == '\n' {
            row += 1;
            column = 0;
        } else {
            column += 1;
        }
    }
    Point::new(row, column)
}

fn make_random_change(doc: &mut Document, shadow: Option<&mut String>, rng: &mut SmallRng) -> Vec<Op> {
    let text = doc.content();
    let doc_len = text.chars().count();
    let insert_weight = if doc_len < 100 { 0.6 } else { 0.4 };

    if doc_len == 0 || rng.gen_bool(insert_weight) {
        let index = rng.gen_range(0..=doc_len);
        let len = rng.gen_range(1..4);
        let content = random_str(len, rng);
        if let Some(shadow) = shadow {
            let byte = shadow
                .char_indices()
                .nth(index)
                .map(|(b, _)| b)
                .unwrap_or(shadow.len());
            shadow.insert_str(byte, &content);
        }
        doc.local_insert_text(&content, point_at(&text, index))
            .unwrap()
            .into_iter()
            .map(Op::Insert)
            .collect()
    } else {
        let start = rng.gen_range(0..doc_len);
        let span = rng.gen_range(1..=usize::min(4, doc_len - start));
        if let Some(shadow) = shadow {
            let bytes: Vec<usize> = shadow
                .char_indices()
                .map(|(b, _)| b)
                .chain([shadow.len()])
                .collect();
            shadow.replace_range(bytes[start]..bytes[start + span], "");
        }
        doc.local_delete(point_at(&text, start), point_at(&text, start + span))
            .unwrap()
            .into_iter()
            .map(Op::Delete)
            .collect()
    }
}

fn apply(doc: &mut Document, op: &Op) {
    match op {
        Op::Insert(atom) => {
            doc.remote_insert(atom.clone()).unwrap();
        }
        Op::Delete(atom) => {
            doc.remote_delete(atom).unwrap();
        }
    }
}

/// Interleaves the streams at random while preserving each stream's own
/// order, then applies everything to `doc`.
fn deliver_interleaved(doc: &mut Document, mut streams: Vec<Vec<Op>>, rng: &mut SmallRng) {
    loop {
        let live: Vec<usize> = streams
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_empty())
            .map(|(i, _)| i)
            .collect();
        if live.is_empty() {
            break;
        }
        let pick = live[rng.gen_range(0..live.len())];
        let op = streams[pick].remove(0);
        apply(doc, &op);
    }
}

#[test]
fn random_single_document_matches_shadow() {
    let mut rng = SmallRng::seed_from_u64(7);
    let mut doc = Document::new(1);
    let mut shadow = String::new();

    for _ in 0..500 {
        make_random_change(&mut doc, Some(&mut shadow), &mut rng);
        assert_eq!(doc.content(), shadow);
        assert!(doc.is_ordered());
    }
}

#[test]
fn fuzz_three_sites_converge() {
    for seed in [1, 20, 42, 1000] {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut docs = vec![Document::new(1), Document::new(2), Document::new(3)];

        for _round in 0..40 {
            let mut outboxes: Vec<Vec<Op>> = vec![Vec::new(); docs.len()];
            for (site, doc) in docs.iter_mut().enumerate() {
                for _ in 0..rng.gen_range(1..4) {
                    outboxes[site].extend(make_random_change(doc, None, &mut rng));
                }
            }

            for (site, doc) in docs.iter_mut().enumerate() {
                let others: Vec<Vec<Op>> = outboxes
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != site)
                    .map(|(_, ops)| ops.clone())
                    .collect();
                deliver_interleaved(doc, others, &mut rng);
            }

            let reference = docs[0].content();
            for doc in &docs {
                assert_eq!(doc.content(), reference, "seed {seed} diverged");
                assert!(doc.is_ordered());
            }
        }
    }
}

#[test]
fn duplicate_delivery_is_idempotent() {
    let mut rng = SmallRng::seed_from_u64(99);
    let mut source = Document::new(1);
    let mut replica = Document::new(2);

    let mut ops = Vec::new();
    for _ in 0..50 {
        ops.extend(make_random_change(&mut source, None, &mut rng));
    }
    for op in &ops {
        apply(&mut replica, op);
    }
    let once = replica.content();

    // Replaying inserts must change nothing; replayed deletes fall into the
    // dropped-delete path and change nothing either.
    for op in &ops {
        apply(&mut replica, op);
    }
    assert_eq!(replica.content(), once);
    assert_eq!(replica.content(), source.content());
}
