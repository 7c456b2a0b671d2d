//! Replicated key-value state machine.

use std::collections::HashMap;

/// Key-value operation parsed from command text.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Operation {
    /// Put a new value into key.
    Put { key: String, value: String },

    /// Get the value of given key.
    Get { key: String },

    /// Remove given key.
    Delete { key: String },

    /// Anything that does not follow the grammar.
    Unrecognized,
}

impl Operation {
    /// Parses `put <key> <value>`, `get <key>` or `delete <key>`. Text that
    /// does not match the grammar yields `Unrecognized`.
    pub fn parse(text: &str) -> Self {
        let segs: Vec<&str> = text.split_whitespace().collect();
        match segs.as_slice() {
            ["put", key, value] => Operation::Put {
                key: key.to_string(),
                value: value.to_string(),
            },
            ["get", key] => Operation::Get {
                key: key.to_string(),
            },
            ["delete", key] => Operation::Delete {
                key: key.to_string(),
            },
            _ => Operation::Unrecognized,
        }
    }
}

/// State is simply a `HashMap` from `String` key -> `String` value.
type State = HashMap<String, String>;

/// The local volatile state machine, plus the index of the next slot to be
/// applied to it.
#[derive(Debug, Default)]
pub struct StateMachine {
    state: State,

    /// Index of the first not-yet-applied slot.
    exec_bar: usize,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the first not-yet-applied slot.
    #[inline]
    pub fn exec_bar(&self) -> usize {
        self.exec_bar
    }

    /// Executes the command text of slot `exec_bar` and advances the bar.
    /// Returns the human-readable result string.
    pub fn apply_next(&mut self, text: &str) -> String {
        self.exec_bar += 1;
        self.execute(&Operation::parse(text))
    }

    /// Executes given operation on the state.
    pub(crate) fn execute(&mut self, op: &Operation) -> String {
        match op {
            Operation::Put { key, value } => {
                self.state.insert(key.clone(), value.clone());
                format!("[{}] => {} added to database", key, value)
            }
            Operation::Get { key } => {
                let value = self.state.get(key).map_or("", |v| v.as_str());
                format!("[{}] => {}", key, value)
            }
            Operation::Delete { key } => {
                let old = self.state.remove(key).unwrap_or_default();
                format!("[{}] => {} deleted from database", key, old)
            }
            Operation::Unrecognized => "Unrecognized command".into(),
        }
    }

    /// Looks up a key without going through consensus.
    pub fn get(&self, key: &str) -> Option<&String> {
        self.state.get(key)
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// All key-value pairs, sorted by key.
    pub fn sorted_pairs(&self) -> Vec<(&String, &String)> {
        let mut pairs: Vec<_> = self.state.iter().collect();
        pairs.sort();
        pairs
    }
}
