// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Depth-first walker over the data model, emitting the same event
//! grammar the build handler accepts. Feeding one document's walk into
//! another document's handler reproduces the tree, which is what the
//! round-trip tests lean on.

use crate::handler::EventSink;
use crate::value::Tag;
use crate::view::ValueRef;

/// Walks `value` depth-first into `sink`. Stops early (returning false)
/// as soon as the sink does.
pub fn walk<S: EventSink>(value: ValueRef<'_>, sink: &mut S) -> bool {
    match value.tag() {
        Tag::Null => sink.push_null(),
        Tag::True => sink.push_bool(true),
        Tag::False => sink.push_bool(false),
        Tag::Int64 => sink.push_int64(value.get_i64()),
        Tag::UInt64 => sink.push_uint64(value.get_u64()),
        Tag::Double => sink.push_double(value.get_f64()),
        Tag::ShortString | Tag::LongString => sink.push_string(value.as_str()),
        Tag::Array => {
            if !sink.start_array() {
                return false;
            }
            for element in value.iter() {
                if !walk(element, sink) {
                    return false;
                }
            }
            sink.end_array(value.array_len())
        }
        Tag::BoolArray => {
            if !sink.start_array() {
                return false;
            }
            for &b in value.bools() {
                if !sink.push_bool(b) {
                    return false;
                }
            }
            sink.end_array(value.barray_len())
        }
        Tag::IntArray => {
            if !sink.start_array() {
                return false;
            }
            for &i in value.ints() {
                if !sink.push_int64(i) {
                    return false;
                }
            }
            sink.end_array(value.iarray_len())
        }
        Tag::DoubleArray => {
            if !sink.start_array() {
                return false;
            }
            for &d in value.doubles() {
                if !sink.push_double(d) {
                    return false;
                }
            }
            sink.end_array(value.darray_len())
        }
        Tag::Object => {
            if !sink.start_object() {
                return false;
            }
            for member in value.members() {
                if !sink.push_key(member.key()) {
                    return false;
                }
                if !walk(member.value(), sink) {
                    return false;
                }
            }
            sink.end_object(value.object_len())
        }
    }
}
