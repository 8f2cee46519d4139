//! Ringtone and ringback playback keyed off call state.
//!
//! Playback failures (blocked autoplay, missing output device) are logged and
//! otherwise ignored; they never affect the call.

use super::state::CallState;
use log::{debug, warn};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    /// Incoming call, played while `Ringing`.
    Ringtone,
    /// Outgoing call, played while `Dialing`.
    Ringback,
}

#[derive(Debug, Error)]
#[error("tone playback failed: {0}")]
pub struct ToneError(pub String);

pub trait TonePlayer: Send + Sync {
    /// Start looping `tone`.
    fn start_loop(&self, tone: Tone) -> Result<(), ToneError>;
    fn stop(&self);
}

/// Player for platforms without audio output.
#[derive(Debug, Default)]
pub struct SilentTonePlayer;

impl TonePlayer for SilentTonePlayer {
    fn start_loop(&self, _tone: Tone) -> Result<(), ToneError> {
        Ok(())
    }

    fn stop(&self) {}
}

pub struct RingtoneController {
    player: Arc<dyn TonePlayer>,
    playing: Option<Tone>,
}

impl RingtoneController {
    pub fn new(player: Arc<dyn TonePlayer>) -> Self {
        Self {
            player,
            playing: None,
        }
    }

    pub fn playing(&self) -> Option<Tone> {
        self.playing
    }

    /// Bring playback in line with `state`.
    pub fn sync(&mut self, state: &CallState) {
        let wanted = match state {
            CallState::Ringing { .. } => Some(Tone::Ringtone),
            CallState::Dialing { .. } => Some(Tone::Ringback),
            _ => None,
        };
        if wanted == self.playing {
            return;
        }

        if self.playing.take().is_some() {
            self.player.stop();
        }
        if let Some(tone) = wanted {
            match self.player.start_loop(tone) {
                Ok(()) => {
                    debug!("Playing {:?}", tone);
                    self.playing = Some(tone);
                }
                Err(e) => warn!("Could not play {:?}: {}", tone, e),
            }
        }
    }
}
