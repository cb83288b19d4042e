//! Continuous MPEG-TS packaging.
//!
//! A single never-ending transport stream starting at the first keyframe at
//! or after the reader's cursor. The byte stream ends when the variant
//! closes or the client goes idle past its read timeout.

use std::io;
use std::time::Duration;

use async_stream::stream;
use bytes::{Bytes, BytesMut};
use futures::Stream;

use crate::relay::{MediaType, ReadOutcome, VariantReader};

use super::mpegts::TsMuxer;

/// How many video samples between PSI repetitions. Players joining a
/// continuous stream mid-flight need periodic PAT/PMT.
const PSI_INTERVAL: u64 = 40;

/// Turns a variant reader into an endless TS byte stream.
///
/// `client_idle` bounds how long the stream waits for a new sample before
/// giving up on a stalled producer.
pub fn continuous_ts(
    mut reader: VariantReader,
    video_codec: crate::relay::CodecTag,
    audio_codec: crate::relay::CodecTag,
    client_idle: Duration,
) -> impl Stream<Item = Result<Bytes, io::Error>> {
    stream! {
        // Start decodable: jump to the oldest retained keyframe.
        reader.rewind_to_keyframe();

        let mut muxer = TsMuxer::new(video_codec, audio_codec);
        let mut since_psi = 0u64;
        let mut started = false;

        loop {
            let outcome =
                match tokio::time::timeout(client_idle, reader.next(MediaType::Video)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        yield Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "no samples within the client idle window",
                        ));
                        return;
                    }
                };

            match outcome {
                ReadOutcome::Closed => return,
                ReadOutcome::Skipped { to } => {
                    log::debug!("[Continuous] reader skipped to seq {to}");
                    continue;
                }
                ReadOutcome::Sample { sample, .. } => {
                    // Output begins at the first keyframe at or after the
                    // starting cursor.
                    if !started {
                        if !sample.keyframe {
                            continue;
                        }
                        started = true;
                    }
                    let mut out = BytesMut::new();
                    if since_psi == 0 {
                        muxer.write_psi(&mut out);
                    }
                    since_psi = (since_psi + 1) % PSI_INTERVAL;

                    // Drain audio that became available alongside video.
                    while let Some(audio) = reader.try_next(MediaType::Audio) {
                        match audio {
                            ReadOutcome::Sample { sample: audio_sample, .. } => {
                                muxer.write_sample(MediaType::Audio, &audio_sample, &mut out);
                            }
                            ReadOutcome::Skipped { .. } => continue,
                            ReadOutcome::Closed => break,
                        }
                    }

                    muxer.write_sample(MediaType::Video, &sample, &mut out);
                    yield Ok(out.freeze());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packagers::mpegts::TS_PACKET_SIZE;
    use crate::relay::{SampleInput, Variant, VariantKey};
    use futures::StreamExt;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn stream_starts_at_keyframe_and_ends_on_close() {
        let variant = Arc::new(Variant::new(VariantKey::new("h264", "aac"), 16, 16));
        variant.push(
            MediaType::Video,
            SampleInput::new(0, Bytes::from_static(b"early")),
        );
        variant.push(
            MediaType::Video,
            SampleInput::new(3000, Bytes::from_static(b"key")).keyframe(),
        );
        variant.push(
            MediaType::Video,
            SampleInput::new(6000, Bytes::from_static(b"delta")),
        );
        let reader = variant.reader();
        variant.close();

        // Reader opened at head, so rewind pulls it back to the keyframe.
        let stream = continuous_ts(
            reader,
            VariantKey::new("h264", "aac").video,
            VariantKey::new("h264", "aac").audio,
            Duration::from_secs(10),
        );
        let chunks: Vec<_> = stream.collect().await;
        // keyframe + delta, stream completed without error.
        assert_eq!(chunks.len(), 2);
        for chunk in chunks {
            let bytes = chunk.expect("ts bytes");
            assert_eq!(bytes.len() % TS_PACKET_SIZE, 0);
        }
    }
}
