//! Sensor sample framing.
//!
//! The sensor streams consecutive `(angle, distance)` pairs, each value a
//! big-endian IEEE-754 `f32`. There is no header; a trailing partial pair
//! stays buffered until the rest arrives.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Bytes per `(angle, distance)` pair.
pub const SAMPLE_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub angle_deg: f32,
    pub distance: f32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SampleCodec;

impl Decoder for SampleCodec {
    type Item = Sample;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < SAMPLE_LEN {
            return Ok(None);
        }
        let angle_deg = src.get_f32();
        let distance = src.get_f32();
        Ok(Some(Sample {
            angle_deg,
            distance,
        }))
    }
}

impl Encoder<Sample> for SampleCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Sample, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(SAMPLE_LEN);
        dst.put_f32(item.angle_deg);
        dst.put_f32(item.distance);
        Ok(())
    }
}
