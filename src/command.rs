//! Command types
//!
//! What callers pass into and get back from the engine.
//!
//! Every mutation reports the sequence number that is authoritative for the
//! key afterwards, which is what optimistic read-modify-write loops need:
//!
//! ```text
//! loop {
//!     let current = engine.get(key)?;                     // value + seq
//!     let next = modify(current.value);
//!     let seq = current.sequence_number.unwrap_or_default();
//!     if engine.replace_with_sequence_number_equals(key, next, seq)?.success {
//!         break;
//!     }
//! }
//! ```

/// Result of a read
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetResult {
    pub value: Option<Vec<u8>>,
    /// Sequence number of the returned value
    pub sequence_number: Option<i64>,
}

impl GetResult {
    pub fn found(value: Vec<u8>, sequence_number: i64) -> Self {
        Self {
            value: Some(value),
            sequence_number: Some(sequence_number),
        }
    }

    pub fn absent() -> Self {
        Self::default()
    }

    pub fn is_found(&self) -> bool {
        self.value.is_some()
    }
}

/// Result of a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModifyResult {
    pub success: bool,
    /// Sequence number now authoritative for the key, when known
    pub sequence_number: Option<i64>,
}

impl ModifyResult {
    pub fn applied(sequence_number: i64) -> Self {
        Self {
            success: true,
            sequence_number: Some(sequence_number),
        }
    }

    /// Rejected; the key currently carries `sequence_number`
    pub fn rejected(sequence_number: i64) -> Self {
        Self {
            success: false,
            sequence_number: Some(sequence_number),
        }
    }

    pub fn failed() -> Self {
        Self {
            success: false,
            sequence_number: None,
        }
    }
}

// =============================================================================
// Generic write dispatch
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Put,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequenceNumberPolicy {
    #[default]
    None,
    /// Only apply if the key's current sequence number equals this one
    ExpectEqual(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordExistsAction {
    #[default]
    None,
    /// Only apply if the key is absent
    CreateOnly,
    /// Only apply if the key is present
    ReplaceOnly,
}

/// Preconditions attached to a [`WriteOp`].
///
/// Legal combinations:
/// ```text
/// op      sequence_number_policy  record_exists_action   behaves as
/// Put     None                    None                   put
/// Put     None                    CreateOnly             put_if_absent
/// Put     None                    ReplaceOnly            replace
/// Put     ExpectEqual(seq)        ReplaceOnly            replace_with_sequence_number_equals
/// Delete  None                    None                   delete
/// Delete  ExpectEqual(seq)        None                   delete_with_sequence_number_equals
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WritePolicy {
    pub sequence_number_policy: SequenceNumberPolicy,
    pub record_exists_action: RecordExistsAction,
}

impl WritePolicy {
    pub fn create_only() -> Self {
        Self {
            record_exists_action: RecordExistsAction::CreateOnly,
            ..Self::default()
        }
    }

    pub fn replace_only() -> Self {
        Self {
            record_exists_action: RecordExistsAction::ReplaceOnly,
            ..Self::default()
        }
    }

    pub fn expect_sequence_number(sequence_number: i64) -> Self {
        Self {
            sequence_number_policy: SequenceNumberPolicy::ExpectEqual(sequence_number),
            ..Self::default()
        }
    }

    pub fn with_record_exists_action(mut self, action: RecordExistsAction) -> Self {
        self.record_exists_action = action;
        self
    }
}
