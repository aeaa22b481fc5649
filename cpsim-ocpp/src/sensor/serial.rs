//! Serial line for the framed sensor

use std::time::Duration;

use tokio_serial::{ClearBuffer, SerialPort, SerialStream};
use tracing::info;

use super::{FramedSensor, SensorError, SensorLink};

impl SensorLink for SerialStream {
    fn discard_input(&mut self) -> std::io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(std::io::Error::from)
    }
}

/// Open the serial device (8N1) and wrap it in a frame decoder
pub fn open_serial(
    path: &str,
    baud_rate: u32,
    frame_timeout: Duration,
) -> Result<FramedSensor, SensorError> {
    let builder = tokio_serial::new(path, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .stop_bits(tokio_serial::StopBits::One)
        .parity(tokio_serial::Parity::None)
        .timeout(frame_timeout);

    let port = SerialStream::open(&builder).map_err(|e| SensorError::Open {
        path: path.to_string(),
        reason: e.to_string(),
    })?;

    info!("Sensor serial port open: {} @ {} baud", path, baud_rate);
    Ok(FramedSensor::new(Box::new(port), frame_timeout))
}
