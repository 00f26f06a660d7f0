use crate::state::{Caret, State};
use heart_api::{block::Block, change::ChangeContent, *};
use std::collections::VecDeque;

/// Frames kept per session.
pub const HISTORY_LIMIT: usize = 100;

/// One undoable apply.
#[derive(Debug, Clone, Default)]
pub(crate) struct Frame {
    /// Block id, value before, value after.
    pub blocks: Vec<(String, Option<Block>, Option<Block>)>,
    /// Detail key, value before, value after.
    pub details: Vec<(String, Option<Value>, Option<Value>)>,
    pub caret: Option<Caret>,
}

impl Frame {
    pub fn from_changes(
        before: &State,
        changes: &[ChangeContent],
        caret: Option<Caret>,
    ) -> Self {
        let mut frame = Frame {
            caret,
            ..Default::default()
        };
        for c in changes {
            match c {
                ChangeContent::BlockSet { block } => frame.blocks.push((
                    block.id.clone(),
                    before.pick(&block.id).cloned(),
                    Some(block.clone()),
                )),
                ChangeContent::BlockRemove { id } => frame.blocks.push((
                    id.clone(),
                    before.pick(id).cloned(),
                    None,
                )),
                ChangeContent::DetailsSet { key, value } => {
                    frame.details.push((
                        key.clone(),
                        before.details().get(key).cloned(),
                        Some(value.clone()),
                    ))
                }
                ChangeContent::DetailsUnset { key } => frame.details.push((
                    key.clone(),
                    before.details().get(key).cloned(),
                    None,
                )),
                _ => (),
            }
        }
        frame
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.details.is_empty()
    }

    /// Write the before (`undo`) or after side of the frame into `state`.
    pub fn restore(&self, state: &mut State, undo: bool) {
        // removals first so re-added blocks are not dropped with a parent
        for (id, before, after) in self.blocks.iter() {
            let target = if undo { before } else { after };
            if target.is_none() {
                state.remove(id);
            }
        }
        for (_, before, after) in self.blocks.iter() {
            let target = if undo { before } else { after };
            if let Some(b) = target {
                state.set(b.clone());
            }
        }
        for (key, before, after) in self.details.iter() {
            match if undo { before } else { after } {
                Some(v) => state.set_detail(key.clone(), v.clone()),
                None => state.remove_detail(key),
            }
        }
    }
}

/// Undo/redo ring of one session.
#[derive(Debug, Default)]
pub(crate) struct History {
    frames: VecDeque<Frame>,
    pos: usize,
}

impl History {
    pub fn push(&mut self, frame: Frame) {
        self.frames.truncate(self.pos);
        self.frames.push_back(frame);
        if self.frames.len() > HISTORY_LIMIT {
            self.frames.pop_front();
        }
        self.pos = self.frames.len();
    }

    pub fn undo(&mut self) -> Option<Frame> {
        if self.pos == 0 {
            return None;
        }
        self.pos -= 1;
        self.frames.get(self.pos).cloned()
    }

    pub fn redo(&mut self) -> Option<Frame> {
        let frame = self.frames.get(self.pos).cloned()?;
        self.pos += 1;
        Some(frame)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }
}
