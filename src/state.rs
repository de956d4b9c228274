use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::db::models::{Character, GeneratedImage};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Submitted(GeneratedImage),
    Finished(GeneratedImage),
}

/// In-memory view of both collections for whoever renders them. Readers get
/// an immutable snapshot; every write swaps in a new one.
#[derive(Clone)]
pub struct JobBoard {
    characters: Arc<RwLock<Arc<Vec<Character>>>>,
    jobs: Arc<RwLock<Arc<Vec<GeneratedImage>>>>,
    events: broadcast::Sender<JobEvent>,
}

impl Default for JobBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl JobBoard {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        JobBoard {
            characters: Arc::new(RwLock::new(Arc::new(Vec::new()))),
            jobs: Arc::new(RwLock::new(Arc::new(Vec::new()))),
            events,
        }
    }

    pub fn load(&self, characters: Vec<Character>, jobs: Vec<GeneratedImage>) {
        *self.characters.write() = Arc::new(characters);
        *self.jobs.write() = Arc::new(jobs);
    }

    pub fn characters(&self) -> Arc<Vec<Character>> {
        self.characters.read().clone()
    }

    pub fn jobs(&self) -> Arc<Vec<GeneratedImage>> {
        self.jobs.read().clone()
    }

    pub fn job(&self, id: &str) -> Option<GeneratedImage> {
        self.jobs.read().iter().find(|job| job.id == id).cloned()
    }

    pub fn upsert_character(&self, character: Character) {
        let mut guard = self.characters.write();
        let mut next: Vec<Character> = guard
            .iter()
            .filter(|existing| existing.id != character.id)
            .cloned()
            .collect();
        next.push(character);
        next.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        *guard = Arc::new(next);
    }

    pub fn remove_character(&self, id: &str) {
        let mut guard = self.characters.write();
        let next = guard.iter().filter(|c| c.id != id).cloned().collect();
        *guard = Arc::new(next);
    }

    pub fn prepend_job(&self, job: GeneratedImage) {
        let mut guard = self.jobs.write();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.push(job);
        next.extend(guard.iter().cloned());
        sort_newest_first(&mut next);
        *guard = Arc::new(next);
    }

    /// Replaces the job with the same id and moves it to the slot its new
    /// `created_at` sorts into. Returns false, and changes nothing, when the
    /// job is no longer on the board.
    pub fn replace_job(&self, job: GeneratedImage) -> bool {
        let mut guard = self.jobs.write();
        let Some(index) = guard.iter().position(|existing| existing.id == job.id) else {
            return false;
        };
        let mut next: Vec<GeneratedImage> = guard.iter().cloned().collect();
        next[index] = job;
        sort_newest_first(&mut next);
        *guard = Arc::new(next);
        true
    }

    pub fn remove_job(&self, id: &str) {
        let mut guard = self.jobs.write();
        let next = guard.iter().filter(|job| job.id != id).cloned().collect();
        *guard = Arc::new(next);
    }

    pub fn clear_jobs(&self) {
        *self.jobs.write() = Arc::new(Vec::new());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn notify(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Same order as the store's job listing: `created_at` descending, then id
/// descending.
fn sort_newest_first(jobs: &mut [GeneratedImage]) {
    jobs.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}
