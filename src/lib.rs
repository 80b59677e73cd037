// Core modules
pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub mod core;
pub mod devices;
pub mod registry;
pub mod timeline;

// The resolve loop
pub mod conductor;

// Re-export key types
pub use clock::{Clock, TimeTranslation, TimecodeTranslation};
pub use conductor::{Conductor, ConductorEvent, StatReport, TriggerTimeFix};
pub use config::{ConductorOptions, ShowConfig, load_show, load_show_from};
pub use self::core::{CommandReceiver, CommandWithContext, DoOnTime, SendMode};
pub use devices::{Device, DeviceContainer, DeviceOptions, Reconciler, StatefulDevice};
pub use error::{ConductorError, ConductorResult, ResolveError};
pub use registry::DeviceRegistry;
pub use timeline::{
    BasicResolver, Enable, Mapping, Mappings, TimelineObject, TimelineResolver, TimelineState,
    Trigger,
};
pub use types::{DeviceId, DeviceType, Time};

/// Build a conductor from a show file: devices are added, then the mappings
/// and timeline are set. The conductor is not initialized yet.
pub async fn conductor_from_show(
    show: ShowConfig,
    options: ConductorOptions,
) -> ConductorResult<Conductor> {
    let conductor = Conductor::new(options);

    for (device_id, device_options) in show.devices {
        conductor.add_device(device_id, device_options).await?;
    }
    conductor
        .set_timeline_and_mappings(show.timeline, show.mappings)
        .await;

    Ok(conductor)
}
