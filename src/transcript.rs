//! Chat transcript records and the live-turn reconciler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::live::InboundEvent;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageAuthor {
    User,
    Assistant,
    System,
}

/// A stable, displayable chat entry.
#[derive(Clone, Debug)]
pub struct Message {
    pub id: u64,
    pub author: MessageAuthor,
    pub text: String,
    pub is_loading: bool,
    /// Detected source language, when a collaborator supplies one. The live
    /// channel does not report it today, so this stays `None`.
    pub language: Option<String>,
}

/// Shared, ordered message list. Cloning shares the underlying storage.
#[derive(Clone)]
pub struct Transcript {
    messages: Arc<Mutex<Vec<Message>>>,
    next_id: Arc<AtomicU64>,
}

impl Transcript {
    pub fn new() -> Self {
        Self {
            messages: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn mint_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Append a new message and return its freshly minted id.
    pub fn append(&self, author: MessageAuthor, text: impl Into<String>) -> u64 {
        let id = self.mint_id();
        self.messages.lock().unwrap().push(Message {
            id,
            author,
            text: text.into(),
            is_loading: false,
            language: None,
        });
        id
    }

    pub fn push_system(&self, text: &str) -> u64 {
        self.append(MessageAuthor::System, text)
    }

    /// Replace the text of an existing message in place. Unknown ids are
    /// ignored (the message may belong to a turn that was already released).
    pub fn upsert(&self, id: u64, text: &str) {
        let mut messages = self.messages.lock().unwrap();
        if let Some(message) = messages.iter_mut().find(|m| m.id == id) {
            message.text = text.to_string();
        }
    }

    pub fn get(&self, id: u64) -> Option<Message> {
        self.messages.lock().unwrap().iter().find(|m| m.id == id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.messages.lock().unwrap().clear();
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

/// Folds incremental transcript fragments into stable message records.
///
/// The channel streams growing partial transcriptions rather than discrete
/// tokens, so the accumulated text always replaces the whole current
/// utterance. Turn boundaries are tracked here because the channel assigns
/// no per-utterance identifiers of its own.
pub struct Reconciler {
    user_partial: String,
    assistant_partial: String,
    open_user_id: Option<u64>,
    open_assistant_id: Option<u64>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self {
            user_partial: String::new(),
            assistant_partial: String::new(),
            open_user_id: None,
            open_assistant_id: None,
        }
    }

    /// Apply every event folded from one wire message. Multiple fragments
    /// for the same author are accumulated first, so the transcript is
    /// mutated at most once per author per message.
    pub fn ingest(&mut self, events: &[InboundEvent], transcript: &Transcript) {
        let mut user_updated = false;
        let mut assistant_updated = false;
        let mut turn_complete = false;

        for event in events {
            match event {
                InboundEvent::UserTranscript(text) => {
                    self.user_partial.push_str(text);
                    user_updated = true;
                }
                InboundEvent::AssistantTranscript(text) => {
                    self.assistant_partial.push_str(text);
                    assistant_updated = true;
                }
                InboundEvent::TurnComplete => turn_complete = true,
                InboundEvent::AudioChunk(_) => {}
            }
        }

        if user_updated {
            self.flush(MessageAuthor::User, transcript);
        }
        if assistant_updated {
            self.flush(MessageAuthor::Assistant, transcript);
        }
        if turn_complete {
            self.close_turn();
        }
    }

    fn flush(&mut self, author: MessageAuthor, transcript: &Transcript) {
        let (partial, open_id) = match author {
            MessageAuthor::User => (&self.user_partial, &mut self.open_user_id),
            MessageAuthor::Assistant => (&self.assistant_partial, &mut self.open_assistant_id),
            MessageAuthor::System => return,
        };

        let text = partial.trim();
        if text.is_empty() {
            return;
        }

        match open_id {
            Some(id) => transcript.upsert(*id, text),
            None => {
                *open_id = Some(transcript.append(author, text));
            }
        }
    }

    /// Close the current turn: clear both accumulators and release both open
    /// ids together. Fragments of the next turn mint fresh ids.
    pub fn close_turn(&mut self) {
        self.user_partial.clear();
        self.assistant_partial.clear();
        self.open_user_id = None;
        self.open_assistant_id = None;
    }

    pub fn open_ids(&self) -> (Option<u64>, Option<u64>) {
        (self.open_user_id, self.open_assistant_id)
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}
