// 音频输出：设备抽象、延迟估计与平滑

pub mod delay;
pub mod sink;
pub mod smoother;
#[cfg(feature = "cpal-output")]
pub mod cpal_device;

pub use delay::{DelayEstimator, DelayMode, DeviceReading};
pub use sink::{
    AudioDevice, AudioFormat, AudioSink, AudioSinkConsumer, DeviceInfo, NullAudioDevice,
    SampleEncoding,
};
pub use smoother::DelaySmoother;
#[cfg(feature = "cpal-output")]
pub use cpal_device::CpalAudioDevice;
