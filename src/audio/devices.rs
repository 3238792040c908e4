//! PulseAudio device discovery.

use crate::error::{Result, SessionError};
use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::def::Retval;
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::proplist::{properties, Proplist};
use std::sync::{Arc, Mutex};
use tracing::error;

/// An input or output device known to the sound server
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// PulseAudio source or sink name, as accepted by `TUTOR_INPUT_DEVICE` /
    /// `TUTOR_OUTPUT_DEVICE`
    pub name: String,
    pub description: String,
    pub sample_rate: u32,
    pub channels: u8,
    /// Monitor of a sink rather than a real microphone
    pub is_monitor: bool,
}

/// Source filter for [`list_devices`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Microphone,
    Monitor,
    Any,
}

fn device_error(msg: &str) -> SessionError {
    SessionError::Device(msg.to_string())
}

fn connect() -> Result<(Mainloop, Context)> {
    let mut proplist = Proplist::new().ok_or_else(|| device_error("failed to create proplist"))?;
    proplist
        .set_str(properties::APPLICATION_NAME, "tutorlive-device-lister")
        .map_err(|_| device_error("failed to set application name"))?;

    let mut mainloop = Mainloop::new().ok_or_else(|| device_error("failed to create mainloop"))?;
    let mut context = Context::new_with_proplist(&mainloop, "tutorlive-context", &proplist)
        .ok_or_else(|| device_error("failed to create context"))?;
    context
        .connect(None, ContextFlagSet::NOFLAGS, None)
        .map_err(|e| SessionError::Device(ToString::to_string(&e)))?;

    loop {
        if !matches!(mainloop.iterate(false), IterateResult::Success(_)) {
            return Err(device_error("mainloop iterate failed"));
        }
        match context.get_state() {
            ContextState::Ready => break,
            ContextState::Failed | ContextState::Terminated => {
                return Err(device_error("connection to sound server failed"))
            }
            _ => {}
        }
    }
    Ok((mainloop, context))
}

fn mark_done(done: &Mutex<bool>) {
    if let Ok(mut done) = done.lock() {
        *done = true;
    }
}

/// Iterate the mainloop until `done` is set, then disconnect.
fn finish(
    mut mainloop: Mainloop,
    mut context: Context,
    done: &Arc<Mutex<bool>>,
    devices: &Arc<Mutex<Vec<AudioDevice>>>,
) -> Result<Vec<AudioDevice>> {
    loop {
        if !matches!(mainloop.iterate(false), IterateResult::Success(_)) {
            return Err(device_error("mainloop iterate failed"));
        }
        if done.lock().map(|d| *d).unwrap_or(true) {
            break;
        }
    }

    let result = devices
        .lock()
        .map(|d| d.clone())
        .map_err(|_| device_error("device list poisoned"));

    context.disconnect();
    mainloop.quit(Retval(0));
    result
}

/// List capture sources.
pub fn list_devices(device_type: DeviceType) -> Result<Vec<AudioDevice>> {
    let (mainloop, context) = connect()?;
    let devices = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(Mutex::new(false));

    let found = devices.clone();
    let finished = done.clone();
    let _op = context
        .introspect()
        .get_source_info_list(move |result| match result {
            ListResult::Item(info) => {
                let is_monitor = info.monitor_of_sink.is_some()
                    || info
                        .name
                        .as_ref()
                        .map(|name| name.contains("monitor"))
                        .unwrap_or(false);
                let wanted = match device_type {
                    DeviceType::Microphone => !is_monitor,
                    DeviceType::Monitor => is_monitor,
                    DeviceType::Any => true,
                };
                if let (true, Some(name), Some(description)) =
                    (wanted, info.name.as_ref(), info.description.as_ref())
                {
                    if let Ok(mut devices) = found.lock() {
                        devices.push(AudioDevice {
                            name: name.to_string(),
                            description: description.to_string(),
                            sample_rate: info.sample_spec.rate,
                            channels: info.sample_spec.channels,
                            is_monitor,
                        });
                    }
                }
            }
            ListResult::End => mark_done(&finished),
            ListResult::Error => {
                error!("Error listing sources");
                mark_done(&finished);
            }
        });

    finish(mainloop, context, &done, &devices)
}

/// List playback sinks.
pub fn list_sinks() -> Result<Vec<AudioDevice>> {
    let (mainloop, context) = connect()?;
    let devices = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(Mutex::new(false));

    let found = devices.clone();
    let finished = done.clone();
    let _op = context
        .introspect()
        .get_sink_info_list(move |result| match result {
            ListResult::Item(info) => {
                if let (Some(name), Some(description)) =
                    (info.name.as_ref(), info.description.as_ref())
                {
                    if let Ok(mut devices) = found.lock() {
                        devices.push(AudioDevice {
                            name: name.to_string(),
                            description: description.to_string(),
                            sample_rate: info.sample_spec.rate,
                            channels: info.sample_spec.channels,
                            is_monitor: false,
                        });
                    }
                }
            }
            ListResult::End => mark_done(&finished),
            ListResult::Error => {
                error!("Error listing sinks");
                mark_done(&finished);
            }
        });

    finish(mainloop, context, &done, &devices)
}
