//! Bounded capture of container output.
//!
//! Container output can be arbitrarily large. Only the beginning and the
//! end are kept, which is where the interesting lines usually are.

use std::collections::VecDeque;

const ELLIPSIS: &str = "\n... output truncated ...\n";

/// Buffer that keeps at most `limit` bytes split evenly between head and tail.
#[derive(Debug)]
pub struct OutputBuffer {
    head: Vec<u8>,
    tail: VecDeque<u8>,
    head_limit: usize,
    tail_limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        let head_limit = limit / 2;
        Self {
            head: Vec::new(),
            tail: VecDeque::new(),
            head_limit,
            tail_limit: limit - head_limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        let room = self.head_limit.saturating_sub(self.head.len());
        let (to_head, rest) = bytes.split_at(room.min(bytes.len()));
        self.head.extend_from_slice(to_head);

        for &b in rest {
            if self.tail.len() == self.tail_limit {
                if self.tail_limit == 0 {
                    self.truncated = true;
                    continue;
                }
                self.tail.pop_front();
                self.truncated = true;
            }
            self.tail.push_back(b);
        }
    }

    pub fn push_line(&mut self, line: &str) {
        self.push(line.as_bytes());
        self.push(b"\n");
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_string(self) -> String {
        let mut out = String::from_utf8_lossy(&self.head).into_owned();
        if self.truncated {
            out.push_str(ELLIPSIS);
        }
        let tail: Vec<u8> = self.tail.into_iter().collect();
        out.push_str(&String::from_utf8_lossy(&tail));
        out
    }
}

/// Truncates a message to `max_chars`, keeping its head and tail.
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    let count = message.chars().count();
    if count <= max_chars {
        return message.to_string();
    }
    let marker = " ... ";
    let keep = max_chars.saturating_sub(marker.len());
    let head_len = keep / 2;
    let tail_len = keep - head_len;
    let head: String = message.chars().take(head_len).collect();
    let tail: String = message.chars().skip(count - tail_len).collect();
    format!("{}{}{}", head, marker, tail)
}
