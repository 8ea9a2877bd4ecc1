use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

use crate::device::{Device, FirmwareStep};
use crate::metrics::METHODS_TOTAL;
use crate::model::{parse_int, MethodInvocation, MethodResult};

pub const CHANGE_LIGHT_STATUS: &str = "ChangeLightStatus";
pub const LIGHT_BLINK: &str = "LightBlink";
pub const INITIATE_FIRMWARE_UPDATE: &str = "InitiateFirmwareUpdate";

/// Work the session must do after the response has been sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    None,
    /// Replace files, restart, then terminate the agent
    ApplyFirmware,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodOutcome {
    pub result: MethodResult,
    pub follow_up: FollowUp,
}

impl MethodOutcome {
    pub fn done(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            result: MethodResult::new(status_code, message),
            follow_up: FollowUp::None,
        }
    }
}

pub type Handler = Box<dyn Fn(&MethodInvocation) -> MethodOutcome + Send + Sync>;

struct Registration {
    signature: String,
    description: String,
    handler: Handler,
}

/// Direct methods by name
#[derive(Default)]
pub struct MethodDispatchTable {
    methods: HashMap<String, Registration>,
}

impl MethodDispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The three methods the board supports, wired to `device`
    pub fn with_device(device: Arc<dyn Device>) -> Self {
        let mut table = Self::new();

        let light = device.clone();
        table.register(
            CHANGE_LIGHT_STATUS,
            &[("LightStatusValue", "int")],
            "Change light status, 0 light off, 1 light on",
            move |invocation| change_light_status(light.as_ref(), invocation),
        );

        let blink = device.clone();
        table.register(LIGHT_BLINK, &[], "Blink Light", move |_| {
            blink.blink_light();
            MethodOutcome::done(200, "Light blink done!")
        });

        table.register(
            INITIATE_FIRMWARE_UPDATE,
            &[("FwPackageURI", "string")],
            "Updates device Firmware. Use parameter FwPackageURI to specify the URI of the firmware file",
            move |invocation| initiate_firmware_update(device.as_ref(), invocation),
        );

        table
    }

    /// Register `handler` under `name`, replacing any previous one. `params`
    /// are (name, type) pairs advertised in the twin.
    pub fn register<F>(&mut self, name: &str, params: &[(&str, &str)], description: &str, handler: F)
    where
        F: Fn(&MethodInvocation) -> MethodOutcome + Send + Sync + 'static,
    {
        let signature = std::iter::once(name.to_string())
            .chain(params.iter().map(|(param, kind)| format!("{}-{}", param, kind)))
            .collect::<Vec<_>>()
            .join("--");

        self.methods.insert(
            name.to_string(),
            Registration {
                signature,
                description: description.to_string(),
                handler: Box::new(handler),
            },
        );
    }

    pub fn dispatch(&self, invocation: &MethodInvocation) -> MethodOutcome {
        let Some(registration) = self.methods.get(&invocation.method_name) else {
            warn!("No handler for method '{}'", invocation.method_name);
            METHODS_TOTAL.with_label_values(&["unknown", "404"]).inc();
            return MethodOutcome::done(404, "Method not found");
        };

        info!("Invoking method '{}'", invocation.method_name);
        let outcome = (registration.handler)(invocation);
        METHODS_TOTAL
            .with_label_values(&[
                invocation.method_name.as_str(),
                outcome.result.status_code.to_string().as_str(),
            ])
            .inc();
        outcome
    }

    /// The `SupportedMethods` section of the reported twin
    pub fn supported_methods(&self) -> BTreeMap<String, String> {
        self.methods
            .values()
            .map(|r| (r.signature.clone(), r.description.clone()))
            .collect()
    }
}

fn change_light_status(device: &dyn Device, invocation: &MethodInvocation) -> MethodOutcome {
    match invocation.payload.get("LightStatusValue").and_then(parse_int) {
        Some(value) => {
            device.set_light(value);
            MethodOutcome::done(200, "ChangeLightStatus done!")
        }
        None => MethodOutcome::done(400, "Invalid LightStatusValue"),
    }
}

fn initiate_firmware_update(device: &dyn Device, invocation: &MethodInvocation) -> MethodOutcome {
    let uri = invocation
        .payload
        .get("FwPackageURI")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    info!("Download firmware from: {}", uri);

    if uri.is_empty() || !device.update_firmware_step(FirmwareStep::Download(uri)) {
        return MethodOutcome::done(500, "Firmware download failed");
    }

    MethodOutcome {
        result: MethodResult::new(200, "Firmware update initiated"),
        follow_up: FollowUp::ApplyFirmware,
    }
}

/// Steps 2 and 3 of a firmware update. Both are local operations and are
/// not reported back.
pub fn apply_firmware(device: &dyn Device) {
    if !device.update_firmware_step(FirmwareStep::Replace) {
        warn!("Firmware replace step reported failure");
    }
    if !device.update_firmware_step(FirmwareStep::Restart) {
        warn!("Firmware restart step reported failure");
    }
}
