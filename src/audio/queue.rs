use std::cell::Cell;
use std::collections::VecDeque;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, info};

use super::track::Track;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoopMode {
    #[default]
    None,
    Track,
    Queue,
}

impl std::str::FromStr for LoopMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(LoopMode::None),
            "track" => Ok(LoopMode::Track),
            "queue" => Ok(LoopMode::Queue),
            other => Err(Error::InvalidConfig(format!("unknown loop mode {other:?}"))),
        }
    }
}

/// Cola de reproducción de un servidor.
///
/// La duración total se cachea y se recalcula tras cada cambio.
#[derive(Debug)]
pub struct TrackQueue {
    items: VecDeque<Track>,
    max_size: usize,
    total_duration: Cell<Option<Duration>>,
}

impl TrackQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
            total_duration: Cell::new(None),
        }
    }

    /// Agrega una canción al final; falla si la cola está llena
    pub fn add(&mut self, track: Track) -> Result<()> {
        if self.items.len() >= self.max_size {
            return Err(Error::QueueFull(self.max_size));
        }

        debug!("Queued: {}", track.title());
        self.items.push_back(track);
        self.invalidate();
        Ok(())
    }

    /// Agrega todas las canciones que quepan y retorna cuántas entraron
    pub fn add_many(&mut self, tracks: impl IntoIterator<Item = Track>) -> usize {
        let available_space = self.max_size.saturating_sub(self.items.len());
        let before = self.items.len();
        self.items.extend(tracks.into_iter().take(available_space));
        let added = self.items.len() - before;

        if added > 0 {
            info!("➕ Queued {} tracks", added);
            self.invalidate();
        }
        added
    }

    /// Pone una canción al frente de la cola. Usado por los modos de
    /// repetición, por eso ignora el límite de tamaño.
    pub fn push_front(&mut self, track: Track) {
        self.items.push_front(track);
        self.invalidate();
    }

    /// Reencola una canción al final sin respetar el límite de tamaño
    pub fn push_back(&mut self, track: Track) {
        self.items.push_back(track);
        self.invalidate();
    }

    /// Obtiene la siguiente canción de la cola
    pub fn next(&mut self) -> Option<Track> {
        let next = self.items.pop_front();
        if next.is_some() {
            self.invalidate();
        }
        next
    }

    pub fn remove(&mut self, index: usize) -> Option<Track> {
        let removed = self.items.remove(index);
        if removed.is_some() {
            self.invalidate();
        }
        removed
    }

    pub fn move_track(&mut self, from: usize, to: usize) -> Result<()> {
        if from >= self.items.len() || to >= self.items.len() {
            return Err(Error::InvalidConfig(format!(
                "queue index out of range ({from} -> {to}, len {})",
                self.items.len()
            )));
        }

        if from != to {
            if let Some(track) = self.items.remove(from) {
                self.items.insert(to, track);
            }
        }
        Ok(())
    }

    pub fn shuffle(&mut self) {
        let mut rng = rand::thread_rng();
        self.items.make_contiguous().shuffle(&mut rng);
    }

    pub fn clear(&mut self) -> usize {
        let cleared = self.items.len();
        self.items.clear();
        self.invalidate();
        cleared
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.items.iter()
    }

    pub fn to_vec(&self) -> Vec<Track> {
        self.items.iter().cloned().collect()
    }

    pub fn total_duration(&self) -> Duration {
        if let Some(total) = self.total_duration.get() {
            return total;
        }

        let total = self.items.iter().map(Track::duration).sum();
        self.total_duration.set(Some(total));
        total
    }

    fn invalidate(&self) {
        self.total_duration.set(None);
    }
}
