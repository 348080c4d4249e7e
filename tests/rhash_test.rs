//! # Resource Hash Integration Tests
//!
//! Round-trips resources through every storage disposition, drives the
//! table through an in-place doubling, and exercises the online prefix
//! learning loop against the persisted prefix list. Dispositions are
//! observed from the outside through `print`'s frequency table rather than
//! by poking at entry bytes.

use tempfile::tempdir;
use tristore::codec::ZBuffer;
use tristore::{LockOp, Lockable, OpenFlags, Resource, ResourceHash, RID_NULL};

const LITERAL: u64 = 0xc000_0000_0000_0000;
const BNODE: u64 = 0x4000_0000_0000_0000;

fn disp_frequencies(rh: &mut ResourceHash) -> String {
    let mut out = Vec::new();
    rh.print(&mut out, 2).unwrap();
    String::from_utf8(out).unwrap()
}

mod dispositions {
    use super::*;

    #[test]
    fn short_strings_stay_inline() {
        let dir = tempdir().unwrap();
        let mut rh = ResourceHash::open(dir.path().join("res"), OpenFlags::read_write()).unwrap();

        rh.put(&Resource::new(0x100, 0x200, "short")).unwrap();
        let res = rh.get(0x100).unwrap();
        assert_eq!(res, Resource::new(0x100, 0x200, "short"));

        let text = disp_frequencies(&mut rh);
        assert!(text.contains("\ni:"), "expected an inline entry:\n{text}");
    }

    #[test]
    fn fifteen_bytes_is_the_inline_boundary() {
        let dir = tempdir().unwrap();
        let mut rh = ResourceHash::open(dir.path().join("res"), OpenFlags::read_write()).unwrap();

        let at = "abcdefghijklmno";
        let over = "abcdefghijklmnop";
        rh.put(&Resource::new(LITERAL | 1, 7, at)).unwrap();
        rh.put(&Resource::new(LITERAL | 2, 8, over)).unwrap();

        assert_eq!(rh.get(LITERAL | 1).unwrap().lex, at);
        assert_eq!(rh.get(LITERAL | 2).unwrap().lex, over);

        let text = disp_frequencies(&mut rh);
        assert!(text.contains("\ni:"));
        assert!(text.contains("\nf:"), "the 16-byte string SHOULD spill:\n{text}");
    }

    #[test]
    fn numeric_lexicals_pack_as_bcd() {
        let dir = tempdir().unwrap();
        let mut rh = ResourceHash::open(dir.path().join("res"), OpenFlags::read_write()).unwrap();

        let lex = "-1.602176634e-19";
        rh.put(&Resource::new(LITERAL | 3, 0x42, lex)).unwrap();
        let res = rh.get(LITERAL | 3).unwrap();
        assert_eq!(res.lex, lex);
        assert_eq!(res.attr, 0x42);

        let text = disp_frequencies(&mut rh);
        assert!(text.contains("\nN:"), "expected a BCD number entry:\n{text}");
    }

    #[test]
    fn datetime_lexicals_pack_as_bcd() {
        let dir = tempdir().unwrap();
        let mut rh = ResourceHash::open(dir.path().join("res"), OpenFlags::read_write()).unwrap();

        let lex = "2011-04-09T12:00:00Z";
        rh.put(&Resource::new(LITERAL | 4, 0x99, lex)).unwrap();
        let res = rh.get(LITERAL | 4).unwrap();
        assert_eq!(res.lex, lex);
        assert_eq!(res.attr, 0x99);

        let text = disp_frequencies(&mut rh);
        assert!(text.contains("\nD:"), "expected a BCD date entry:\n{text}");
    }

    #[test]
    fn medium_strings_spill_raw() {
        let dir = tempdir().unwrap();
        let mut rh = ResourceHash::open(dir.path().join("res"), OpenFlags::read_write()).unwrap();

        let lex = "a string too long for the inline payload but too short to deflate";
        rh.put(&Resource::new(LITERAL | 5, 0x1, lex)).unwrap();
        let res = rh.get(LITERAL | 5).unwrap();
        assert_eq!(res.lex, lex);
        assert_eq!(res.attr, 0x1);
    }

    #[test]
    fn long_strings_deflate_with_exact_framing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("res");
        let mut rh = ResourceHash::open(&path, OpenFlags::read_write()).unwrap();

        let lex = "A".repeat(10_000);
        let lex_file = {
            let mut os = path.as_os_str().to_owned();
            os.push(".lex");
            std::path::PathBuf::from(os)
        };
        let before = std::fs::metadata(&lex_file).unwrap().len();

        rh.put(&Resource::new(0x200, 0, lex.as_str())).unwrap();
        let res = rh.get(0x200).unwrap();
        assert_eq!(res.lex, lex);
        assert_eq!(res.attr, 0);

        // the payload is {comp_len, uncomp_len, stream, NUL}
        let comp_len = ZBuffer::new().compress(lex.as_bytes()).unwrap().len() as u64;
        let after = std::fs::metadata(&lex_file).unwrap().len();
        assert_eq!(after - before, comp_len + 9);

        let text = disp_frequencies(&mut rh);
        assert!(text.contains("\nZ:"), "expected a deflated entry:\n{text}");
    }

    #[test]
    fn duplicate_rid_put_is_a_no_op() {
        let dir = tempdir().unwrap();
        let mut rh = ResourceHash::open(dir.path().join("res"), OpenFlags::read_write()).unwrap();

        rh.put(&Resource::new(LITERAL | 6, 1, "first")).unwrap();
        rh.put(&Resource::new(LITERAL | 6, 2, "second")).unwrap();

        let res = rh.get(LITERAL | 6).unwrap();
        assert_eq!(res.lex, "first");
        assert_eq!(res.attr, 1);
        assert_eq!(rh.count().unwrap(), 1);
    }

    #[test]
    fn missing_rid_reports_not_found() {
        let dir = tempdir().unwrap();
        let mut rh = ResourceHash::open(dir.path().join("res"), OpenFlags::read_write()).unwrap();

        rh.put(&Resource::new(0x100, 0, "here")).unwrap();
        let err = rh.get(0xdead00).unwrap_err();
        assert!(err.to_string().contains("not found"), "got: {err}");
    }

    #[test]
    fn everything_survives_a_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("res");
        let long = "B".repeat(5000);

        {
            let mut rh = ResourceHash::open(&path, OpenFlags::read_write()).unwrap();
            rh.put(&Resource::new(0x100, 0x1, "inline")).unwrap();
            rh.put(&Resource::new(LITERAL | 1, 0x2, "31415926535897932384")).unwrap();
            rh.put(&Resource::new(LITERAL | 2, 0x3, long.as_str())).unwrap();
        }

        let mut rh = ResourceHash::open(&path, OpenFlags::read_write()).unwrap();
        assert_eq!(rh.count().unwrap(), 3);
        assert_eq!(rh.get(0x100).unwrap().lex, "inline");
        assert_eq!(rh.get(LITERAL | 1).unwrap().lex, "31415926535897932384");
        assert_eq!(rh.get(LITERAL | 2).unwrap().lex, long);
    }
}

mod doubling {
    use super::*;

    /// RIDs crafted to share one home bucket until the table doubles, with a
    /// mix of inline, BCD, and deflated payloads riding along.
    fn colliders() -> Vec<Resource> {
        (0..33u64)
            .map(|j| {
                let rid = (5 + j * 65536) << 10;
                let lex = match j % 3 {
                    0 => "x".repeat(150 + j as usize),
                    1 => format!("res-{j}"),
                    _ => format!("9000000000000000{j}"),
                };
                Resource::new(rid, 0, lex)
            })
            .collect()
    }

    #[test]
    fn overflowing_a_probe_window_doubles_the_table() {
        let dir = tempdir().unwrap();
        let mut rh = ResourceHash::open(dir.path().join("res"), OpenFlags::read_write()).unwrap();

        let resources = colliders();
        rh.lock(LockOp::Exclusive).unwrap();
        for res in &resources {
            rh.put_locked(res).unwrap();
        }
        rh.lock(LockOp::Unlock).unwrap();

        assert_eq!(rh.count().unwrap(), 33);

        rh.lock(LockOp::Shared).unwrap();
        for res in &resources {
            let got = rh.get_locked(res.rid).unwrap();
            assert_eq!(got.lex, res.lex, "resource {:016x} SHOULD survive doubling", res.rid);
            assert_eq!(got.attr, res.attr);
        }
        rh.lock(LockOp::Unlock).unwrap();
    }

    #[test]
    fn doubled_table_survives_a_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("res");
        let resources = colliders();

        {
            let mut rh = ResourceHash::open(&path, OpenFlags::read_write()).unwrap();
            rh.lock(LockOp::Exclusive).unwrap();
            for res in &resources {
                rh.put_locked(res).unwrap();
            }
            rh.lock(LockOp::Unlock).unwrap();
        }

        let mut rh = ResourceHash::open(&path, OpenFlags::read_write()).unwrap();
        for res in &resources {
            assert_eq!(rh.get(res.rid).unwrap().lex, res.lex);
        }
    }
}

mod prefixes {
    use super::*;

    fn item_uri(i: usize) -> String {
        format!("http://example.org/resource/item/{i:04}/detail")
    }

    #[test]
    fn shared_prefixes_are_learned_and_applied() {
        let dir = tempdir().unwrap();
        let mut rh = ResourceHash::open(dir.path().join("res"), OpenFlags::read_write()).unwrap();

        rh.lock(LockOp::Exclusive).unwrap();
        for i in 0..100 {
            rh.put_locked(&Resource::new((0x40 + i as u64) << 10, 0, item_uri(i)))
                .unwrap();
        }
        rh.lock(LockOp::Unlock).unwrap();

        // every URI reads back whole, whichever disposition it landed in
        rh.lock(LockOp::Shared).unwrap();
        for i in 0..100 {
            let res = rh.get_locked((0x40 + i as u64) << 10).unwrap();
            assert_eq!(res.lex, item_uri(i));
        }
        rh.lock(LockOp::Unlock).unwrap();

        let text = disp_frequencies(&mut rh);
        assert!(
            text.contains("\nf:"),
            "the first puts SHOULD have spilled while learning:\n{text}"
        );
        assert!(
            text.contains("\np:") || text.contains("\nP:"),
            "later puts SHOULD use the learned prefix:\n{text}"
        );
        assert!(text.contains("prefix 1:"), "the dictionary SHOULD list its prefixes:\n{text}");
    }

    #[test]
    fn learned_prefixes_persist_through_the_prefix_list() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("res");

        {
            let mut rh = ResourceHash::open(&path, OpenFlags::read_write()).unwrap();
            rh.lock(LockOp::Exclusive).unwrap();
            for i in 0..100 {
                rh.put_locked(&Resource::new((0x40 + i as u64) << 10, 0, item_uri(i)))
                    .unwrap();
            }
            rh.lock(LockOp::Unlock).unwrap();
        }

        // a fresh handle loads the dictionary from the prefix list and
        // compresses immediately: a prefixed inline put leaves the lex file
        // untouched
        let lex_file = {
            let mut os = path.as_os_str().to_owned();
            os.push(".lex");
            std::path::PathBuf::from(os)
        };
        let mut rh = ResourceHash::open(&path, OpenFlags::read_write()).unwrap();
        let before = std::fs::metadata(&lex_file).unwrap().len();
        rh.put(&Resource::new(0x5000 << 10, 0, item_uri(42))).unwrap();
        let after = std::fs::metadata(&lex_file).unwrap().len();

        assert_eq!(rh.get(0x5000 << 10).unwrap().lex, item_uri(42));
        assert_eq!(
            after, before,
            "a put matching a learned prefix SHOULD stay inline"
        );
    }

    #[test]
    fn long_suffixes_spill_with_the_prefix_code() {
        let dir = tempdir().unwrap();
        let mut rh = ResourceHash::open(dir.path().join("res"), OpenFlags::read_write()).unwrap();

        rh.lock(LockOp::Exclusive).unwrap();
        // fill the learner so the prefix gets registered
        for i in 0..100 {
            rh.put_locked(&Resource::new((0x40 + i as u64) << 10, 0, item_uri(i)))
                .unwrap();
        }
        // now a URI whose suffix cannot fit inline
        let long_tail = format!(
            "http://example.org/resource/item/0001/a-very-long-tail-{}",
            "y".repeat(40)
        );
        rh.put_locked(&Resource::new(0x9000 << 10, 0, long_tail.as_str()))
            .unwrap();
        rh.lock(LockOp::Unlock).unwrap();

        assert_eq!(rh.get(0x9000 << 10).unwrap().lex, long_tail);
    }
}

mod batches {
    use super::*;

    #[test]
    fn put_multi_skips_nulls_and_duplicates() {
        let dir = tempdir().unwrap();
        let mut rh = ResourceHash::open(dir.path().join("res"), OpenFlags::read_write()).unwrap();

        let mut batch = vec![
            Resource::new(0x300, 1, "one"),
            Resource::new(RID_NULL, 0, "ignored"),
            Resource::new(0x300, 2, "dup"),
            Resource::new(0x400, 3, "two"),
        ];
        rh.put_multi(&mut batch).unwrap();

        assert_eq!(rh.count().unwrap(), 2);
        assert_eq!(rh.get(0x300).unwrap().lex, "one");
        assert_eq!(rh.get(0x400).unwrap().lex, "two");
    }

    #[test]
    fn get_multi_resolves_bnodes_and_flags_misses() {
        let dir = tempdir().unwrap();
        let mut rh = ResourceHash::open(dir.path().join("res"), OpenFlags::read_write()).unwrap();

        rh.put(&Resource::new(0x300, 9, "stored")).unwrap();

        let mut batch = vec![
            Resource::new(0x300, 0, ""),
            Resource::new(BNODE | 0xabc, 0, ""),
            Resource::new(0x7777, 0, ""),
        ];
        let missing = rh.get_multi(&mut batch).unwrap();
        assert_eq!(missing, 1);

        let by_rid = |rid: u64| batch.iter().find(|r| r.rid == rid).unwrap().clone();
        assert_eq!(by_rid(0x300).lex, "stored");
        assert_eq!(by_rid(0x300).attr, 9);
        assert_eq!(by_rid(BNODE | 0xabc).lex, format!("_:b{:x}", BNODE | 0xabc));
        assert_eq!(by_rid(BNODE | 0xabc).attr, RID_NULL);
        assert!(by_rid(0x7777).lex.contains("not found"));
        assert_eq!(by_rid(0x7777).attr, RID_NULL);
    }
}
