// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Binary envelope for a suspended processing context.
//!
//! Layout:
//!
//! ```text
//! "MATSjmts" | version (1) | field count N | NUL f1 NUL f2 NUL ... f(N-1) NUL | trace bytes
//! ```
//!
//! N counts the NUL delimiters. Version 1 writes five fields (endpoint id,
//! stage id, next stage id, trace meta, message id), so N = 6. Readers skip
//! any fields past the fifth, which keeps later additions readable.

use crate::error::StashError;

pub const STASH_MAGIC: &[u8; 8] = b"MATSjmts";
pub const STASH_VERSION: u8 = 1;

const KNOWN_FIELDS: usize = 5;
const HEADER_LEN: usize = STASH_MAGIC.len() + 2;
/// Written in place of the next stage id when the stashing stage is the last one.
const NO_NEXT_STAGE: &str = "\u{2}";

/// Everything needed to resume a stage out of band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StashedContext {
    pub endpoint_id: String,
    pub stage_id: String,
    pub next_stage_id: Option<String>,
    pub trace_meta: String,
    pub message_id: String,
    pub trace_bytes: Vec<u8>,
}

impl StashedContext {
    pub fn encode(&self) -> Vec<u8> {
        let fields = [
            self.endpoint_id.as_str(),
            self.stage_id.as_str(),
            self.next_stage_id.as_deref().unwrap_or(NO_NEXT_STAGE),
            self.trace_meta.as_str(),
            self.message_id.as_str(),
        ];
        let metadata_len: usize = fields.iter().map(|f| f.len() + 1).sum::<usize>() + 1;
        let mut out = Vec::with_capacity(HEADER_LEN + metadata_len + self.trace_bytes.len());
        out.extend_from_slice(STASH_MAGIC);
        out.push(STASH_VERSION);
        out.push((KNOWN_FIELDS + 1) as u8);
        out.push(0);
        for field in fields {
            out.extend_from_slice(field.as_bytes());
            out.push(0);
        }
        out.extend_from_slice(&self.trace_bytes);
        out
    }

    pub fn decode(stash: &[u8]) -> Result<Self, StashError> {
        if stash.len() < HEADER_LEN + 1 {
            return Err(StashError::TooShort { len: stash.len() });
        }
        for (index, expected) in STASH_MAGIC.iter().enumerate() {
            if stash[index] != *expected {
                return Err(StashError::BadMagic {
                    index,
                    expected: *expected,
                    actual: stash[index],
                });
            }
        }
        let version = stash[STASH_MAGIC.len()];
        if version != STASH_VERSION {
            return Err(StashError::UnsupportedVersion(version));
        }
        let zeros = stash[STASH_MAGIC.len() + 1];
        if (zeros as usize) < KNOWN_FIELDS + 1 {
            return Err(StashError::TooFewFields(zeros));
        }
        if stash[HEADER_LEN] != 0 {
            return Err(StashError::MissingDelimiter(0));
        }

        let mut pos = HEADER_LEN + 1;
        let mut fields: Vec<&[u8]> = Vec::with_capacity(KNOWN_FIELDS);
        for field_no in 1..zeros as usize {
            let end = stash[pos..]
                .iter()
                .position(|b| *b == 0)
                .map(|offset| pos + offset)
                .ok_or(StashError::MissingDelimiter(field_no))?;
            if fields.len() < KNOWN_FIELDS {
                fields.push(&stash[pos..end]);
            }
            pos = end + 1;
        }

        let text = |index: usize, field: &'static str| -> Result<String, StashError> {
            std::str::from_utf8(fields[index])
                .map(str::to_string)
                .map_err(|_| StashError::Utf8 { field })
        };
        let next_stage_id = text(2, "nextStageId")?;

        Ok(Self {
            endpoint_id: text(0, "endpointId")?,
            stage_id: text(1, "stageId")?,
            next_stage_id: (next_stage_id != NO_NEXT_STAGE).then_some(next_stage_id),
            trace_meta: text(3, "traceMeta")?,
            message_id: text(4, "messageId")?,
            trace_bytes: stash[pos..].to_vec(),
        })
    }
}
