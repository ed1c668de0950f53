//! Mute effects attached to other apps' sessions.
//!
//! Capturing an app's output while it keeps playing would make every sound
//! audible twice, so each admitted session gets an effect that drives its
//! own output to silence. The host may take that effect away at any time;
//! the status handler installed here reacts to that.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::model::SessionInfo;
use crate::{SessionResult, EFFECT_PRIORITY};

/// Input gain applied by the dynamics variant, far below audibility.
pub const DYNAMICS_MUTE_GAIN_DB: f32 = -200.0;

/// Level applied by the volume variant together with its mute flag.
pub const VOLUME_MUTE_LEVEL_DB: i16 = -96;

/// Effect types a host may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectType {
    /// Multi-band dynamics processing with per-channel input gain.
    DynamicsProcessing,

    /// Hidden per-session volume effect with an explicit mute flag.
    Volume,
}

impl EffectType {
    /// Returns the display name for this type.
    pub fn name(self) -> &'static str {
        match self {
            Self::DynamicsProcessing => "DynamicsProcessing",
            Self::Volume => "Volume",
        }
    }
}

/// How a session is silenced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MuteEffectKind {
    /// Attenuate the input of every channel.
    DynamicsAttenuation { input_gain_db: f32 },

    /// Set the mute flag and drop the level.
    VolumeMute { level_db: i16 },
}

impl MuteEffectKind {
    /// Variants in the order they are tried.
    pub const PRIORITY_ORDER: [MuteEffectKind; 2] = [
        MuteEffectKind::DynamicsAttenuation {
            input_gain_db: DYNAMICS_MUTE_GAIN_DB,
        },
        MuteEffectKind::VolumeMute {
            level_db: VOLUME_MUTE_LEVEL_DB,
        },
    ];

    /// Host effect type implementing this variant.
    pub fn effect_type(&self) -> EffectType {
        match self {
            Self::DynamicsAttenuation { .. } => EffectType::DynamicsProcessing,
            Self::VolumeMute { .. } => EffectType::Volume,
        }
    }
}

/// Asynchronous status changes reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectStatus {
    /// The effect was disabled by someone else.
    EnableLost,

    /// Another client with higher priority took control.
    ControlLost,

    /// Control came back to us.
    ControlRegained,
}

/// Callback receiving [`EffectStatus`] changes.
pub type StatusHandler = Box<dyn Fn(EffectStatus) + Send + Sync>;

/// Callback invoked when a session can no longer be kept silent.
pub type SessionLossCallback = Arc<dyn Fn(SessionInfo) + Send + Sync>;

/// A live effect instance owned by the host.
pub trait EffectInstance: Send + Sync {
    /// Apply the silencing parameters of `kind`.
    fn apply(&self, kind: &MuteEffectKind) -> SessionResult<()>;

    /// Enable or disable the effect.
    fn set_enabled(&self, enabled: bool) -> SessionResult<()>;

    /// Install the status handler, replacing any previous one.
    fn set_status_handler(&self, handler: StatusHandler);

    /// Release the instance. Further calls are no-ops.
    fn release(&self);
}

/// Host primitive for attaching effects to sessions.
pub trait EffectHost: Send + Sync {
    /// Whether the host offers this effect type.
    fn is_available(&self, effect: EffectType) -> bool;

    /// Instantiate an effect on a session.
    fn create(
        &self,
        effect: EffectType,
        session_id: i32,
        priority: i32,
    ) -> SessionResult<Arc<dyn EffectInstance>>;

    /// Ask the owning app to close its effect control session. Best effort.
    fn close_control_session(&self, package_name: &str, session_id: i32);
}

/// A mute effect bound to one session.
pub struct MuteEffect {
    session: SessionInfo,
    kind: MuteEffectKind,
    instance: Arc<dyn EffectInstance>,
}

impl MuteEffect {
    /// The silencing variant in use.
    pub fn kind(&self) -> MuteEffectKind {
        self.kind
    }

    /// The session this effect is attached to.
    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    /// Disable then release the effect.
    pub fn release(self) {
        debug!(session_id = self.session.session_id, "Releasing mute effect");
        if let Err(e) = self.instance.set_enabled(false) {
            debug!("Disabling effect before release failed: {}", e);
        }
        self.instance.release();
    }
}

impl std::fmt::Debug for MuteEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuteEffect")
            .field("session", &self.session)
            .field("kind", &self.kind)
            .finish()
    }
}

fn reassert(instance: &dyn EffectInstance, kind: &MuteEffectKind) -> SessionResult<()> {
    instance.apply(kind)?;
    instance.set_enabled(true)
}

/// Builds mute effects, falling back through [`MuteEffectKind::PRIORITY_ORDER`].
#[derive(Clone)]
pub struct MuteEffectFactory {
    host: Arc<dyn EffectHost>,
}

impl MuteEffectFactory {
    /// Create a factory on top of a host.
    pub fn new(host: Arc<dyn EffectHost>) -> Self {
        Self { host }
    }

    /// Whether the host offers any effect type able to mute a session.
    pub fn is_device_compatible(&self) -> bool {
        MuteEffectKind::PRIORITY_ORDER
            .iter()
            .any(|kind| self.host.is_available(kind.effect_type()))
    }

    /// Attach a mute effect to a session.
    ///
    /// Returns `None` when no effect type could be attached. Callers must
    /// treat that as an incompatible app: the session would stay audible.
    pub fn make(&self, session: &SessionInfo, on_loss: SessionLossCallback) -> Option<MuteEffect> {
        for kind in MuteEffectKind::PRIORITY_ORDER {
            let effect_type = kind.effect_type();
            if !self.host.is_available(effect_type) {
                debug!(effect = effect_type.name(), "Effect type unavailable, skipping");
                continue;
            }

            match self.attach(kind, session, Arc::clone(&on_loss)) {
                Ok(effect) => {
                    info!(
                        session_id = session.session_id,
                        package = %session.package_name,
                        effect = effect_type.name(),
                        "Mute effect attached"
                    );
                    return Some(effect);
                }
                Err(e) => {
                    warn!(
                        effect = effect_type.name(),
                        "Failed to attach mute effect: {}, trying next type", e
                    );
                }
            }
        }

        warn!(
            session_id = session.session_id,
            package = %session.package_name,
            "No mute effect could be attached"
        );
        None
    }

    fn attach(
        &self,
        kind: MuteEffectKind,
        session: &SessionInfo,
        on_loss: SessionLossCallback,
    ) -> SessionResult<MuteEffect> {
        let instance = self
            .host
            .create(kind.effect_type(), session.session_id, EFFECT_PRIORITY)?;

        if let Err(e) = reassert(instance.as_ref(), &kind) {
            instance.release();
            return Err(e);
        }

        let weak = Arc::downgrade(&instance);
        let host = Arc::clone(&self.host);
        let lost_session = session.clone();
        instance.set_status_handler(Box::new(move |status| {
            let Some(instance) = weak.upgrade() else {
                return;
            };

            let lost = match status {
                EffectStatus::ControlLost => true,
                EffectStatus::EnableLost | EffectStatus::ControlRegained => {
                    match reassert(instance.as_ref(), &kind) {
                        Ok(()) => {
                            debug!(?status, session_id = lost_session.session_id, "Mute reasserted");
                            false
                        }
                        Err(e) => {
                            warn!(?status, "Failed to reassert mute: {}", e);
                            true
                        }
                    }
                }
            };

            if lost {
                warn!(
                    session_id = lost_session.session_id,
                    package = %lost_session.package_name,
                    "Session lost"
                );
                host.close_control_session(&lost_session.package_name, lost_session.session_id);
                on_loss(lost_session.clone());
            }
        }));

        Ok(MuteEffect {
            session: session.clone(),
            kind,
            instance,
        })
    }
}
