//! Helpers on top of the operational transformation algebra.

use operational_transform::{Operation, OperationSeq};

/// Forward-map a codepoint index through an operation.
///
/// Used to keep a user's cursors and selections in place while other users'
/// edits are applied around them. All indices are Unicode codepoint offsets.
pub fn transform_index(operation: &OperationSeq, position: u32) -> u32 {
    let mut index = position as i64;
    let mut new_index = index;
    for op in operation.ops() {
        match op {
            Operation::Retain(n) => index -= *n as i64,
            Operation::Insert(s) => new_index += s.chars().count() as i64,
            Operation::Delete(n) => {
                new_index -= std::cmp::min(index, *n as i64);
                index -= *n as i64;
            }
        }
        if index < 0 {
            break;
        }
    }
    new_index as u32
}
