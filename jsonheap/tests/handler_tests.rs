// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::rc::Rc;

use jsonheap::{walk, Document, DynamicDocument, EventSink, HeapAlloc, Tag};

#[test]
fn builds_a_flat_object() {
    let mut doc = DynamicDocument::new();
    {
        let mut h = doc.make_handler(true);
        h.start_object();
        h.push_key("flag");
        h.push_bool(true);
        h.push_key("count");
        h.push_int64(-3);
        h.push_key("big");
        h.push_uint64(u64::MAX);
        h.push_key("ratio");
        h.push_double(0.25);
        h.push_key("name");
        h.push_string("short");
        h.push_key("story");
        h.push_string("a string long enough to be pooled");
        h.push_key("nothing");
        h.push_null();
        h.end_object(7);
        h.finalize(true, false);
    }

    let view = doc.croot();
    assert_eq!(view.tag(), Tag::Object);
    assert_eq!(view.object_len(), 7);
    assert!(view.member(0).unwrap().value().get_bool());
    assert_eq!(view.member(1).unwrap().value().get_i64(), -3);
    assert_eq!(view.member(2).unwrap().value().get_u64(), u64::MAX);
    assert_eq!(view.member(3).unwrap().value().get_f64(), 0.25);
    assert_eq!(view.member(4).unwrap().value().tag(), Tag::ShortString);
    assert_eq!(view.member(5).unwrap().value().tag(), Tag::LongString);
    assert_eq!(
        view.member(5).unwrap().value().as_str(),
        "a string long enough to be pooled"
    );
    assert!(view.member(6).unwrap().value().is_null());
}

#[test]
fn bool_run_specializes() {
    let mut doc = DynamicDocument::new();
    {
        let mut h = doc.make_handler(true);
        h.start_array();
        h.push_bool(true);
        h.push_bool(false);
        h.push_bool(true);
        h.end_array(3);
        h.finalize(false, false);
    }
    assert_eq!(doc.croot().tag(), Tag::BoolArray);
    assert_eq!(doc.croot().bools(), [true, false, true]);
}

#[test]
fn int_run_specializes_and_uint_folds_in() {
    let mut doc = DynamicDocument::new();
    {
        let mut h = doc.make_handler(true);
        h.start_array();
        h.push_int(1);
        h.push_uint(2);
        h.push_int64(-3);
        h.push_uint64(4);
        h.end_array(4);
        h.finalize(false, false);
    }
    assert_eq!(doc.croot().tag(), Tag::IntArray);
    assert_eq!(doc.croot().ints(), [1, 2, -3, 4]);
}

#[test]
fn int_then_double_promotes_with_flag() {
    let mut doc = DynamicDocument::new();
    {
        let mut h = doc.make_handler(true);
        h.start_array();
        h.push_int64(1);
        h.push_int64(2);
        h.push_double(3.5);
        h.end_array(3);
        h.finalize(false, false);
    }
    assert_eq!(doc.croot().tag(), Tag::DoubleArray);
    assert_eq!(doc.croot().doubles(), [1.0, 2.0, 3.5]);
}

#[test]
fn double_then_int_stays_double_with_flag() {
    let mut doc = DynamicDocument::new();
    {
        let mut h = doc.make_handler(true);
        h.start_array();
        h.push_double(0.5);
        h.push_int64(2);
        h.end_array(2);
        h.finalize(false, false);
    }
    assert_eq!(doc.croot().tag(), Tag::DoubleArray);
    assert_eq!(doc.croot().doubles(), [0.5, 2.0]);
}

#[test]
fn int_then_double_degenerates_without_flag() {
    let mut doc = DynamicDocument::new();
    {
        let mut h = doc.make_handler(false);
        h.start_array();
        h.push_int64(1);
        h.push_int64(2);
        h.push_double(3.5);
        h.end_array(3);
        h.finalize(false, false);
    }
    let view = doc.croot();
    assert_eq!(view.tag(), Tag::Array);
    assert_eq!(view.array_len(), 3);
    assert_eq!(view.get(0).unwrap().tag(), Tag::Int64);
    assert_eq!(view.get(0).unwrap().get_i64(), 1);
    assert_eq!(view.get(1).unwrap().tag(), Tag::Int64);
    assert_eq!(view.get(2).unwrap().tag(), Tag::Double);
    assert_eq!(view.get(2).unwrap().get_f64(), 3.5);
}

#[test]
fn heterogeneous_mix_forces_generic() {
    let mut doc = DynamicDocument::new();
    {
        let mut h = doc.make_handler(true);
        h.start_array();
        h.push_bool(true);
        h.push_int64(1);
        h.end_array(2);
        h.finalize(false, false);
    }
    let view = doc.croot();
    assert_eq!(view.tag(), Tag::Array);
    assert_eq!(view.get(0).unwrap().tag(), Tag::True);
    assert_eq!(view.get(1).unwrap().get_i64(), 1);
}

#[test]
fn oversized_uint_degenerates_an_int_run() {
    let mut doc = DynamicDocument::new();
    {
        let mut h = doc.make_handler(true);
        h.start_array();
        h.push_int64(1);
        h.push_uint64(u64::MAX);
        h.end_array(2);
        h.finalize(false, false);
    }
    let view = doc.croot();
    assert_eq!(view.tag(), Tag::Array);
    assert_eq!(view.get(0).unwrap().get_i64(), 1);
    assert_eq!(view.get(1).unwrap().get_u64(), u64::MAX);
}

#[test]
fn strings_keep_arrays_generic() {
    let mut doc = DynamicDocument::new();
    {
        let mut h = doc.make_handler(true);
        h.start_array();
        h.push_string("short");
        h.push_string("a rather long string for the pool");
        h.end_array(2);
        h.finalize(false, false);
    }
    let view = doc.croot();
    assert_eq!(view.tag(), Tag::Array);
    assert_eq!(view.get(0).unwrap().tag(), Tag::ShortString);
    assert_eq!(view.get(1).unwrap().tag(), Tag::LongString);
    assert_eq!(view.get(1).unwrap().as_str(), "a rather long string for the pool");
}

#[test]
fn short_string_boundaries_round_trip() {
    let mut doc = DynamicDocument::new();
    {
        let mut h = doc.make_handler(true);
        h.start_array();
        h.push_string("");
        h.push_string("abcdefghijklm"); // 13 bytes, the longest inline
        h.push_string("abcdefghijklmn"); // 14 bytes, pooled
        h.end_array(3);
        h.finalize(false, false);
    }
    let view = doc.croot();
    assert_eq!(view.get(0).unwrap().tag(), Tag::ShortString);
    assert_eq!(view.get(0).unwrap().str_len(), 0);
    assert_eq!(view.get(1).unwrap().tag(), Tag::ShortString);
    assert_eq!(view.get(1).unwrap().as_str(), "abcdefghijklm");
    assert_eq!(view.get(2).unwrap().tag(), Tag::LongString);
}

#[test]
fn nested_containers() {
    let mut doc = DynamicDocument::new();
    {
        let mut h = doc.make_handler(true);
        h.start_object();
        h.push_key("list");
        h.start_array();
        h.push_int64(1);
        h.push_int64(2);
        h.end_array(2);
        h.push_key("inner");
        h.start_object();
        h.push_key("deep");
        h.start_array();
        h.push_bool(false);
        h.end_array(1);
        h.end_object(1);
        h.push_key("empty_list");
        h.start_array();
        h.end_array(0);
        h.push_key("empty_obj");
        h.start_object();
        h.end_object(0);
        h.end_object(4);
        h.finalize(true, true);
    }

    let view = doc.croot();
    assert_eq!(view.object_len(), 4);
    let list = view.member(0).unwrap().value();
    assert_eq!(list.tag(), Tag::IntArray);
    assert_eq!(list.ints(), [1, 2]);
    let inner = view.member(1).unwrap().value();
    assert_eq!(inner.tag(), Tag::Object);
    let deep = inner.member(0).unwrap().value();
    assert_eq!(deep.tag(), Tag::BoolArray);
    assert_eq!(deep.bools(), [false]);
    let empty_list = view.member(2).unwrap().value();
    assert_eq!(empty_list.tag(), Tag::Array);
    assert_eq!(empty_list.array_len(), 0);
    let empty_obj = view.member(3).unwrap().value();
    assert_eq!(empty_obj.tag(), Tag::Object);
    assert_eq!(empty_obj.object_len(), 0);
}

#[test]
fn containers_inside_arrays_force_generic() {
    let mut doc = DynamicDocument::new();
    {
        let mut h = doc.make_handler(true);
        h.start_array();
        h.push_int64(7);
        h.start_object();
        h.push_key("k");
        h.push_int64(8);
        h.end_object(1);
        h.push_int64(9);
        h.end_array(3);
        h.finalize(false, false);
    }
    let view = doc.croot();
    assert_eq!(view.tag(), Tag::Array);
    assert_eq!(view.array_len(), 3);
    assert_eq!(view.get(0).unwrap().get_i64(), 7);
    let obj = view.get(1).unwrap();
    assert_eq!(obj.tag(), Tag::Object);
    assert_eq!(obj.member(0).unwrap().value().get_i64(), 8);
    assert_eq!(view.get(2).unwrap().get_i64(), 9);
}

#[test]
fn big_int_array_through_the_handler() {
    let mut doc = DynamicDocument::new();
    {
        let mut h = doc.make_handler(true);
        h.start_array();
        for i in 0..70_000i64 {
            h.push_int64(i);
        }
        h.end_array(70_000);
        h.finalize(true, false);
    }
    let view = doc.croot();
    assert_eq!(view.tag(), Tag::IntArray);
    assert_eq!(view.iarray_len(), 70_000);
    assert_eq!(view.iarray_capacity(), 70_000);
    // Above the inline capacity limit the run lives in a big descriptor.
    assert_eq!(view.iarray_mem_size(), 8 + 70_000 * 8);
    assert_eq!(view.ints()[69_999], 69_999);
}

#[test]
fn handler_reuse_after_clear() {
    let mut doc = DynamicDocument::new();
    {
        let mut h = doc.make_handler(true);
        h.start_object();
        h.push_key("a");
        h.push_int64(1);
        // Abandon this build mid-stream and start over.
        h.clear();
        h.start_array();
        h.push_int64(5);
        h.end_array(1);
        h.finalize(false, false);
    }
    assert_eq!(doc.croot().tag(), Tag::IntArray);
    assert_eq!(doc.croot().ints(), [5]);
}

#[test]
fn finalize_shrinks_the_document() {
    let base = Rc::new(HeapAlloc::new());
    let mut doc: DynamicDocument = Document::with_base(Rc::clone(&base));
    {
        let mut h = doc.make_handler(true);
        h.start_array();
        for i in 0..100 {
            h.push_int64(i);
        }
        h.end_array(100);
        let with_stack = base.allocated();
        h.finalize(true, true);
        assert_eq!(h.stack_capacity(), 0);
        assert!(base.allocated() < with_stack);
    }
    assert_eq!(doc.croot().ints().len(), 100);
}

#[test]
fn borrowed_pushes_avoid_copies() {
    let backing_key = String::from("zero copy key that is long enough");
    let backing_val = String::from("zero copy value that is long enough");
    let mut doc = DynamicDocument::new();
    {
        let mut h = doc.make_handler(true);
        h.start_object();
        // SAFETY: the backing strings outlive the document.
        unsafe {
            h.push_key_borrowed(&backing_key);
            h.push_string_borrowed(&backing_val);
        }
        h.end_object(1);
        h.finalize(false, false);
    }
    let view = doc.croot();
    let member = view.member(0).unwrap();
    assert_eq!(member.key(), backing_key);
    assert!(!member.key_owned());
    assert_eq!(member.value().as_str(), backing_val);
    // The long-string cell points straight at the caller's bytes.
    assert_eq!(member.value().as_str().as_ptr(), backing_val.as_ptr());
    drop(doc);
    drop((backing_key, backing_val));
}

#[test]
fn walker_round_trips_an_editor_built_tree() {
    let mut original = DynamicDocument::new();
    {
        let mut root = original.root();
        root.entry("title").set_str("a document title long enough");
        root.entry("short").set_str("tiny");
        root.entry("n").set_i64(-12);
        root.entry("u").set_u64(u64::MAX);
        root.entry("x").set_f64(6.5);
        root.entry("yes").set_bool(true);
        root.entry("no").set_bool(false);
        root.entry("nil").set_null();
        {
            let mut bools = root.entry("bools");
            bools.to_barray();
            bools.barray_push(true);
            bools.barray_push(false);
        }
        {
            let mut ints = root.entry("ints");
            ints.to_iarray();
            for i in 0..40 {
                ints.iarray_push(i);
            }
        }
        {
            let mut doubles = root.entry("doubles");
            doubles.to_darray();
            doubles.darray_push(0.5);
            doubles.darray_push(-1.25);
        }
        {
            let mut mixed = root.entry("mixed");
            mixed.to_array();
            mixed.array_push_i64(1);
            mixed.array_push_str("inner string that is long enough");
            mixed.array_push_null();
            mixed.index(3).entry("nested").set_bool(true);
        }
        root.entry("empty");
    }

    let mut rebuilt = DynamicDocument::new();
    {
        let mut h = rebuilt.make_handler(true);
        assert!(walk(original.croot(), &mut h));
        h.finalize(true, false);
    }

    assert!(original.croot() == rebuilt.croot());
    assert_eq!(rebuilt.croot().object_len(), 13);
    assert_eq!(
        rebuilt.croot().member(9).unwrap().value().tag(),
        Tag::IntArray
    );
}

#[test]
fn walker_round_trips_through_a_shared_pool() {
    let shared = DynamicDocument::make_shared_string_pool(Rc::new(HeapAlloc::new()));
    let mut original: DynamicDocument = Document::with_pool(Rc::clone(&shared));
    original
        .root()
        .entry("key string long enough to pool")
        .set_str("value string long enough to pool");
    let pooled = shared.borrow().len();

    let mut rebuilt: DynamicDocument = Document::with_pool(Rc::clone(&shared));
    {
        let mut h = rebuilt.make_handler(true);
        assert!(walk(original.croot(), &mut h));
        h.finalize(true, false);
    }
    assert!(original.croot() == rebuilt.croot());
    // Every string deduplicated against the shared pool.
    assert_eq!(shared.borrow().len(), pooled);
}

/// A sink that records event names, for checking the walker's grammar.
#[derive(Default)]
struct Recorder {
    events: Vec<String>,
}

impl EventSink for Recorder {
    fn start_object(&mut self) -> bool {
        self.events.push("{".into());
        true
    }
    fn end_object(&mut self, n: u32) -> bool {
        self.events.push(format!("}}{n}"));
        true
    }
    fn start_array(&mut self) -> bool {
        self.events.push("[".into());
        true
    }
    fn end_array(&mut self, n: u32) -> bool {
        self.events.push(format!("]{n}"));
        true
    }
    fn push_key(&mut self, key: &str) -> bool {
        self.events.push(format!("k:{key}"));
        true
    }
    fn push_null(&mut self) -> bool {
        self.events.push("null".into());
        true
    }
    fn push_bool(&mut self, b: bool) -> bool {
        self.events.push(format!("b:{b}"));
        true
    }
    fn push_int64(&mut self, i: i64) -> bool {
        self.events.push(format!("i:{i}"));
        true
    }
    fn push_uint64(&mut self, u: u64) -> bool {
        self.events.push(format!("u:{u}"));
        true
    }
    fn push_double(&mut self, d: f64) -> bool {
        self.events.push(format!("d:{d}"));
        true
    }
    fn push_string(&mut self, s: &str) -> bool {
        self.events.push(format!("s:{s}"));
        true
    }
}

#[test]
fn walker_emits_the_handler_grammar() {
    let mut doc = DynamicDocument::new();
    {
        let mut root = doc.root();
        root.entry("a").set_i64(1);
        let mut ints = root.entry("b");
        ints.to_iarray();
        ints.iarray_push(2);
        ints.iarray_push(3);
    }

    let mut recorder = Recorder::default();
    assert!(walk(doc.croot(), &mut recorder));
    assert_eq!(
        recorder.events,
        ["{", "k:a", "i:1", "k:b", "[", "i:2", "i:3", "]2", "}2"]
    );
}
