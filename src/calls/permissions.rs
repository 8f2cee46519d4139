//! Camera and microphone permission negotiation.
//!
//! [`PermissionNegotiator::acquire`] never prompts when the platform already
//! reports an explicit denial, asks for quality constraints first and retries
//! once with minimal constraints when those are rejected as over-constrained.
//! Every failure comes back as a classified [`MediaFailure`].

use super::error::{DeviceError, DeviceSet, MediaFailure};
use super::media::MediaStream;
use crate::types::call::CallKind;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Microphone,
    Camera,
}

impl DeviceKind {
    /// Devices a call of `kind` needs.
    pub fn required_for(kind: CallKind) -> &'static [DeviceKind] {
        match kind {
            CallKind::Audio => &[DeviceKind::Microphone],
            CallKind::Video => &[DeviceKind::Microphone, DeviceKind::Camera],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    Denied,
    Prompt,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoConstraints {
    pub ideal_width: Option<u32>,
    pub ideal_height: Option<u32>,
    pub ideal_frame_rate: Option<u32>,
    pub facing_user: bool,
}

/// Capture constraints passed to the device surface.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaConstraints {
    pub audio: AudioConstraints,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    /// 1280x720 at 30 fps with audio processing enabled.
    pub fn quality(kind: CallKind) -> Self {
        Self {
            audio: AudioConstraints {
                echo_cancellation: true,
                noise_suppression: true,
                auto_gain_control: true,
            },
            video: kind.is_video().then_some(VideoConstraints {
                ideal_width: Some(1280),
                ideal_height: Some(720),
                ideal_frame_rate: Some(30),
                facing_user: true,
            }),
        }
    }

    /// Bare device request with nothing the platform could reject.
    pub fn minimal(kind: CallKind) -> Self {
        Self {
            audio: AudioConstraints {
                echo_cancellation: false,
                noise_suppression: false,
                auto_gain_control: false,
            },
            video: kind.is_video().then_some(VideoConstraints {
                ideal_width: None,
                ideal_height: None,
                ideal_frame_rate: None,
                facing_user: false,
            }),
        }
    }

    pub fn wants_video(&self) -> bool {
        self.video.is_some()
    }
}

/// Local device permission surface.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Best-effort query of an existing grant. `None` when the platform cannot tell.
    async fn permission_state(&self, device: DeviceKind) -> Option<PermissionState>;

    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, DeviceError>;
}

pub struct PermissionNegotiator {
    devices: Arc<dyn MediaDevices>,
}

impl PermissionNegotiator {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self { devices }
    }

    /// Devices needed for `kind` that the platform reports as explicitly denied.
    pub async fn denied_devices(&self, kind: CallKind) -> Vec<DeviceKind> {
        let mut denied = Vec::new();
        for &device in DeviceKind::required_for(kind) {
            if self.devices.permission_state(device).await == Some(PermissionState::Denied) {
                denied.push(device);
            }
        }
        denied
    }

    pub async fn acquire(&self, kind: CallKind) -> Result<MediaStream, MediaFailure> {
        let denied = self.denied_devices(kind).await;
        if let Some(devices) = device_set(&denied) {
            info!("{} access previously denied, not prompting", devices);
            return Err(MediaFailure::PermissionDenied { devices });
        }

        match self
            .devices
            .get_user_media(&MediaConstraints::quality(kind))
            .await
        {
            Ok(stream) => Ok(stream),
            Err(DeviceError::OverConstrained(constraint)) => {
                warn!(
                    "Quality constraints rejected ({}), retrying {} capture with minimal constraints",
                    constraint, kind
                );
                self.devices
                    .get_user_media(&MediaConstraints::minimal(kind))
                    .await
                    .map_err(|e| classify(e, kind))
            }
            Err(e) => Err(classify(e, kind)),
        }
    }
}

fn device_set(devices: &[DeviceKind]) -> Option<DeviceSet> {
    let mic = devices.contains(&DeviceKind::Microphone);
    let camera = devices.contains(&DeviceKind::Camera);
    match (mic, camera) {
        (true, true) => Some(DeviceSet::CameraAndMicrophone),
        (true, false) => Some(DeviceSet::Microphone),
        (false, true) => Some(DeviceSet::Camera),
        (false, false) => None,
    }
}

/// Map a raw device error to the failure taxonomy.
fn classify(error: DeviceError, kind: CallKind) -> MediaFailure {
    debug!("Classifying {} capture failure: {}", kind, error);
    match error {
        DeviceError::NotFound | DeviceError::OverConstrained(_) => MediaFailure::DeviceNotFound,
        DeviceError::NotReadable | DeviceError::Aborted => MediaFailure::DeviceBusy,
        DeviceError::NotAllowed | DeviceError::Other(_) => MediaFailure::PermissionDenied {
            devices: device_set(DeviceKind::required_for(kind))
                .unwrap_or(DeviceSet::Microphone),
        },
    }
}
