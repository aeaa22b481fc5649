//! Framed ASCII sensor decoder
//!
//! The sensor emits frames of the form `!v1 i1 v2 i2 ... @`: a start marker,
//! up to ten space-separated numeric fields (voltage/current pairs per port)
//! and an end marker. Each phase of a read is bounded by the frame timeout.
//! Power to a port is switched with `P,<port>,<1|0>\n`.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{Sample, SensorError};

pub const START_MARKER: u8 = b'!';
pub const END_MARKER: u8 = b'@';

/// Number of numeric fields a frame may carry
pub const MAX_FIELDS: usize = 10;

/// Byte stream a framed sensor is attached to
pub trait SensorLink: AsyncRead + AsyncWrite + Unpin + Send {
    /// Drop bytes received before this read cycle
    fn discard_input(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SensorLink for tokio::io::DuplexStream {}

/// Decoder over a sensor byte stream
pub struct FramedSensor {
    link: Box<dyn SensorLink>,
    frame_timeout: Duration,
    values: [f64; MAX_FIELDS],
}

impl FramedSensor {
    pub fn new(link: Box<dyn SensorLink>, frame_timeout: Duration) -> Self {
        Self {
            link,
            frame_timeout,
            values: [0.0; MAX_FIELDS],
        }
    }

    /// Latest decoded field values
    pub fn values(&self) -> &[f64; MAX_FIELDS] {
        &self.values
    }

    /// Read one frame and return samples for `ports` ports
    pub async fn read(&mut self, ports: usize) -> Result<Vec<Sample>, SensorError> {
        if let Err(e) = self.link.discard_input() {
            debug!("Could not clear sensor input: {}", e);
        }

        let payload = self.read_frame().await?;
        self.parse_fields(&payload);

        Ok((0..ports)
            .map(|port| {
                let v = port * 2;
                if v + 1 < MAX_FIELDS {
                    Sample::new(self.values[v], self.values[v + 1])
                } else {
                    Sample::default()
                }
            })
            .collect())
    }

    async fn read_frame(&mut self) -> Result<String, SensorError> {
        let link = &mut self.link;

        timeout(self.frame_timeout, async {
            loop {
                if next_byte(link).await? == START_MARKER {
                    return Ok::<_, SensorError>(());
                }
            }
        })
        .await
        .map_err(|_| SensorError::StartTimeout(self.frame_timeout))??;

        let payload = timeout(self.frame_timeout, async {
            let mut data = String::new();
            loop {
                match next_byte(link).await? {
                    END_MARKER => return Ok::<_, SensorError>(data),
                    // A new start marker restarts the frame
                    START_MARKER => data.clear(),
                    b @ (b'0'..=b'9' | b'.' | b' ') => data.push(b as char),
                    _ => {}
                }
            }
        })
        .await
        .map_err(|_| SensorError::EndTimeout(self.frame_timeout))??;

        if payload.trim().is_empty() {
            return Err(SensorError::EmptyFrame);
        }

        Ok(payload)
    }

    /// Fold a frame payload into the stored values.
    /// A field that does not parse keeps its previous value.
    fn parse_fields(&mut self, payload: &str) {
        for (i, token) in payload.split_whitespace().take(MAX_FIELDS).enumerate() {
            match token.parse::<f64>() {
                Ok(value) => self.values[i] = value,
                Err(_) => warn!("Invalid sensor field {}: {:?}", i, token),
            }
        }
    }

    /// Send the power control command for a port
    pub async fn set_power(&mut self, port: u32, enable: bool) -> Result<(), SensorError> {
        let command = format!("P,{},{}\n", port, if enable { 1 } else { 0 });
        self.link.write_all(command.as_bytes()).await?;
        self.link.flush().await?;
        info!("Port {}: power {}", port, if enable { "enabled" } else { "cut" });
        Ok(())
    }
}

async fn next_byte(link: &mut Box<dyn SensorLink>) -> Result<u8, SensorError> {
    match link.read_u8().await {
        Ok(byte) => Ok(byte),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(SensorError::Closed),
        Err(e) => Err(SensorError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    impl SensorLink for tokio_test::io::Mock {}

    fn sensor() -> (FramedSensor, tokio::io::DuplexStream) {
        let (ours, theirs) = duplex(256);
        (FramedSensor::new(Box::new(ours), Duration::from_secs(1)), theirs)
    }

    #[tokio::test]
    async fn test_decode_frame() {
        let (mut sensor, mut device) = sensor();
        device.write_all(b"!220.0 13.6 0.0 0.0 0.0 0.0@").await.unwrap();

        let samples = sensor.read(3).await.unwrap();
        assert_eq!(samples[0], Sample::new(220.0, 13.6));
        assert_eq!(samples[1], Sample::default());
        assert!(samples[0].power() > 2990.0 && samples[0].power() < 2993.0);
    }

    #[tokio::test]
    async fn test_leading_noise_and_restart() {
        let (mut sensor, mut device) = sensor();
        device.write_all(b"xx@!99 1!230.5 x2.0 7@").await.unwrap();

        let samples = sensor.read(2).await.unwrap();
        assert_eq!(samples[0], Sample::new(230.5, 2.0));
        assert_eq!(samples[1].voltage, 7.0);
    }

    #[tokio::test]
    async fn test_invalid_field_keeps_previous() {
        let (mut sensor, mut device) = sensor();
        device.write_all(b"!220.0 10.0@").await.unwrap();
        sensor.read(1).await.unwrap();

        device.write_all(b"!1.2.3 11.0@").await.unwrap();
        let samples = sensor.read(1).await.unwrap();
        assert_eq!(samples[0], Sample::new(220.0, 11.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_frame_times_out() {
        let (mut sensor, mut device) = sensor();
        device.write_all(b"!220.0").await.unwrap();

        assert!(matches!(sensor.read(1).await, Err(SensorError::EndTimeout(_))));
        // Nothing was folded in
        assert_eq!(sensor.values()[0], 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_start_marker() {
        let (mut sensor, _device) = sensor();
        assert!(matches!(sensor.read(1).await, Err(SensorError::StartTimeout(_))));
    }

    #[tokio::test]
    async fn test_empty_frame() {
        let (mut sensor, mut device) = sensor();
        device.write_all(b"!  @").await.unwrap();
        assert!(matches!(sensor.read(1).await, Err(SensorError::EmptyFrame)));
    }

    #[tokio::test]
    async fn test_closed_stream() {
        let (mut sensor, device) = sensor();
        drop(device);
        assert!(matches!(sensor.read(1).await, Err(SensorError::Closed)));
    }

    #[tokio::test]
    async fn test_power_command() {
        let mock = tokio_test::io::Builder::new()
            .write(b"P,2,1\n")
            .write(b"P,3,0\n")
            .build();
        let mut sensor = FramedSensor::new(Box::new(mock), Duration::from_secs(1));

        sensor.set_power(2, true).await.unwrap();
        sensor.set_power(3, false).await.unwrap();
    }
}
