//! Push-style Vorbis decoding.
//!
//! The decoder never reads the stream itself. [`VorbisPushDecoder`] is fed
//! byte chunks and reports how many bytes it used; [`VorbisStream`] owns the
//! stream, reads chunks ahead of the decoder and rewinds to the first unused
//! byte after every step.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use carillon_core::{Error, Result, CHANNELS};
use lewton::audio::{read_audio_packet, PreviousWindowRight};
use lewton::header::{
    read_header_comment, read_header_ident, read_header_setup, IdentHeader, SetupHeader,
};
use ogg::reading::{BasePacketReader, OggPage, PageParser};
use ogg::OggReadError;
use tracing::{debug, trace, warn};

use super::source::SharedStream;
use super::validate_stream;

/// Initial probe prefix.
const PROBE_START_BYTES: usize = 256;

/// Largest prefix the probe will read looking for the three header packets.
const PROBE_MAX_BYTES: usize = 1 << 20;

/// Smallest read-ahead chunk. Ten times this is above the largest Ogg page,
/// so a well-formed stream always makes progress before the cap is hit.
pub const MIN_CHUNK_BYTES: usize = 8192;

/// Read-ahead growth limit, as a multiple of [`MIN_CHUNK_BYTES`].
const MAX_CHUNK_FACTOR: usize = 10;

const CAPTURE_PATTERN: &[u8; 4] = b"OggS";

/// Fixed part of an Ogg page header, up to and including the segment count.
const PAGE_HEADER_BYTES: usize = 27;

const FLAG_FIRST_PAGE: u8 = 0x02;
const FLAG_LAST_PAGE: u8 = 0x04;

/// A verified page split off the front of a chunk.
struct SplitPage {
    page: OggPage,
    serial: u32,
    flags: u8,
    len: usize,
}

/// Split the page at the start of `chunk`. `Ok(None)` means the chunk ends
/// inside the page.
fn split_page(chunk: &[u8]) -> std::result::Result<Option<SplitPage>, OggReadError> {
    if chunk.len() < PAGE_HEADER_BYTES {
        return Ok(None);
    }
    if !chunk.starts_with(CAPTURE_PATTERN) {
        return Err(OggReadError::NoCapturePatternFound);
    }
    let mut header = [0u8; PAGE_HEADER_BYTES];
    header.copy_from_slice(&chunk[..PAGE_HEADER_BYTES]);
    let flags = header[5];
    let serial = u32::from_le_bytes([header[14], header[15], header[16], header[17]]);

    let (mut parser, segments) = PageParser::new(header)?;
    let body_start = PAGE_HEADER_BYTES + segments;
    let Some(lacing) = chunk.get(PAGE_HEADER_BYTES..body_start) else {
        return Ok(None);
    };
    let len = body_start + parser.parse_segments(lacing.to_vec());
    let Some(body) = chunk.get(body_start..len) else {
        return Ok(None);
    };
    let page = parser.parse_packet_data(body.to_vec())?;
    Ok(Some(SplitPage {
        page,
        serial,
        flags,
        len,
    }))
}

/// Offset of the next capture pattern after the first byte of `chunk`.
fn next_capture(chunk: &[u8]) -> Option<usize> {
    chunk
        .get(1..)?
        .windows(CAPTURE_PATTERN.len())
        .position(|window| window == CAPTURE_PATTERN)
        .map(|at| at + 1)
}

/// Result of trying to open a decoder from a stream prefix.
pub enum PushOpen {
    /// Headers parsed; the decoder used the first `consumed` bytes.
    Ready {
        decoder: Box<VorbisPushDecoder>,
        consumed: usize,
    },
    /// The prefix ends before the headers do.
    NeedMoreData,
    /// The prefix can never become a Vorbis stream.
    Invalid(Error),
}

/// Result of feeding one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStep {
    /// The chunk does not hold a whole page, and no later page starts in it.
    NeedMoreData,
    /// A page was taken from the front of the chunk.
    Consumed(usize),
    /// The front of the chunk was not a valid page; this many bytes up to
    /// the next capture pattern were dropped.
    Skipped(usize),
}

/// Vorbis decoder state fed one Ogg page at a time.
pub struct VorbisPushDecoder {
    ident: IdentHeader,
    setup: SetupHeader,
    previous_window: PreviousWindowRight,
    packets: BasePacketReader,
    serial: u32,
    saw_last_page: bool,
    /// No packet of the last pushed page is left.
    drained: bool,
}

impl VorbisPushDecoder {
    /// Parse the identification, comment and setup packets at the start of
    /// `prefix`. The first page must start at offset 0.
    pub fn open(prefix: &[u8]) -> PushOpen {
        let invalid = |message: String| PushOpen::Invalid(Error::UnsupportedFormat(message));

        let mut packets = BasePacketReader::new();
        let mut headers: Vec<Vec<u8>> = Vec::with_capacity(3);
        let mut offset = 0;
        let mut serial = None;
        let mut saw_last_page = false;

        while headers.len() < 3 {
            let page = match split_page(&prefix[offset..]) {
                Ok(None) => return PushOpen::NeedMoreData,
                Ok(Some(page)) => page,
                Err(e) => return invalid(format!("ogg: {e}")),
            };
            offset += page.len;

            match serial {
                None if page.flags & FLAG_FIRST_PAGE == 0 => {
                    return invalid("ogg: stream does not start with a first page".to_string());
                }
                None => serial = Some(page.serial),
                Some(s) if s != page.serial => continue,
                Some(_) => {}
            }

            saw_last_page |= page.flags & FLAG_LAST_PAGE != 0;
            if let Err(e) = packets.push_page(page.page) {
                return invalid(format!("ogg: {e}"));
            }
            while headers.len() < 3 {
                match packets.read_packet() {
                    Some(packet) => headers.push(packet.data),
                    None => break,
                }
            }
        }

        let invalid_header = |what: &str, e: &dyn std::fmt::Debug| {
            PushOpen::Invalid(Error::UnsupportedFormat(format!("vorbis {what}: {e:?}")))
        };
        let ident = match read_header_ident(&headers[0]) {
            Ok(ident) => ident,
            Err(e) => return invalid_header("identification header", &e),
        };
        if let Err(e) = read_header_comment(&headers[1]) {
            return invalid_header("comment header", &e);
        }
        let setup = match read_header_setup(
            &headers[2],
            ident.audio_channels,
            (ident.blocksize_0, ident.blocksize_1),
        ) {
            Ok(setup) => setup,
            Err(e) => return invalid_header("setup header", &e),
        };

        PushOpen::Ready {
            decoder: Box::new(Self {
                ident,
                setup,
                previous_window: PreviousWindowRight::new(),
                packets,
                serial: serial.unwrap_or_default(),
                saw_last_page,
                drained: false,
            }),
            consumed: offset,
        }
    }

    pub const fn sample_rate(&self) -> u32 {
        self.ident.audio_sample_rate
    }

    pub fn channels(&self) -> usize {
        usize::from(self.ident.audio_channels)
    }

    /// Whether the final page of the stream has been fed and all of its
    /// packets decoded.
    pub const fn is_finished(&self) -> bool {
        self.saw_last_page && self.drained
    }

    /// Decode one already-assembled packet into `out`. Returns false when no
    /// packet is queued.
    pub fn decode_queued(&mut self, out: &mut Vec<i16>) -> Result<bool> {
        let Some(packet) = self.packets.read_packet() else {
            self.drained = true;
            return Ok(false);
        };
        let planes = read_audio_packet(
            &self.ident,
            &self.setup,
            &packet.data,
            &mut self.previous_window,
        )
        .map_err(|e| Error::AudioDecode(format!("vorbis: {e:?}")))?;

        if let [left, right] = planes.as_slice() {
            out.reserve(left.len() * CHANNELS);
            for (&l, &r) in left.iter().zip(right) {
                out.push(l);
                out.push(r);
            }
        }
        Ok(true)
    }

    /// Feed the page at the start of `chunk`. Queued packets must have been
    /// decoded first, since a new page replaces them.
    pub fn push_page(&mut self, chunk: &[u8]) -> Result<PushStep> {
        let page = match split_page(chunk) {
            Ok(None) => return Ok(PushStep::NeedMoreData),
            Ok(Some(page)) => page,
            Err(e) => {
                return Ok(match next_capture(chunk) {
                    Some(skip) => {
                        warn!("vorbis: skipping {skip} bytes of damaged ogg data ({e})");
                        // Packets spanning the lost bytes are dropped, not glued.
                        self.packets.update_after_seek();
                        PushStep::Skipped(skip)
                    }
                    None => PushStep::NeedMoreData,
                });
            }
        };

        if page.serial != self.serial {
            trace!("skipping ogg page of stream {}", page.serial);
            return Ok(PushStep::Consumed(page.len));
        }
        self.packets
            .push_page(page.page)
            .map_err(|e| Error::AudioDecode(format!("ogg: {e}")))?;
        self.saw_last_page |= page.flags & FLAG_LAST_PAGE != 0;
        self.drained = false;
        Ok(PushStep::Consumed(page.len))
    }
}

/// A Vorbis stream read through a growable read-ahead chunk.
pub struct VorbisStream {
    stream: SharedStream,
    decoder: Box<VorbisPushDecoder>,
    chunk: Vec<u8>,
    /// Decoded samples not handed out yet.
    cache: Vec<i16>,
    cache_pos: usize,
    finished: bool,
}

impl VorbisStream {
    /// Probe the stream from its start with a growing prefix. On success the
    /// stream is left positioned at the first byte the decoder did not use.
    pub fn probe(stream: SharedStream, len: Option<u64>) -> Result<Self> {
        let limit = len.map_or(PROBE_MAX_BYTES, |len| {
            usize::try_from(len).unwrap_or(usize::MAX).min(PROBE_MAX_BYTES)
        });
        let mut want = PROBE_START_BYTES.min(limit);
        let mut prefix = Vec::new();

        loop {
            prefix.resize(want, 0);
            let read = {
                let mut s = stream.lock();
                s.seek(0)?;
                s.read(&mut prefix)?
            };

            match VorbisPushDecoder::open(&prefix[..read]) {
                PushOpen::Ready { decoder, consumed } => {
                    validate_stream(decoder.channels(), decoder.sample_rate())?;
                    stream.lock().seek(consumed as u64)?;
                    debug!(
                        "vorbis stream accepted: {} Hz, headers in {consumed} bytes",
                        decoder.sample_rate()
                    );
                    return Ok(Self {
                        stream,
                        decoder,
                        chunk: vec![0; MIN_CHUNK_BYTES],
                        cache: Vec::new(),
                        cache_pos: 0,
                        finished: false,
                    });
                }
                PushOpen::Invalid(e) => return Err(e),
                PushOpen::NeedMoreData if read < want || want >= limit => {
                    return Err(Error::UnsupportedFormat(
                        "vorbis: headers do not fit in the probed prefix".to_string(),
                    ));
                }
                PushOpen::NeedMoreData => want = (want * 2).min(limit),
            }
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.decoder.sample_rate()
    }

    /// Fill `out` with interleaved stereo samples. Returns the number of
    /// frames written; fewer than requested only at end of stream.
    pub fn read_frames(&mut self, out: &mut [i16]) -> Result<usize> {
        let wanted = out.len() / CHANNELS * CHANNELS;
        let mut written = 0;

        while written < wanted {
            let available = self.cache.len() - self.cache_pos;
            if available > 0 {
                let n = available.min(wanted - written);
                out[written..written + n]
                    .copy_from_slice(&self.cache[self.cache_pos..self.cache_pos + n]);
                self.cache_pos += n;
                written += n;
                continue;
            }
            self.cache.clear();
            self.cache_pos = 0;

            if self.finished {
                break;
            }
            if self.decoder.decode_queued(&mut self.cache)? {
                continue;
            }
            if self.decoder.is_finished() {
                self.finished = true;
                break;
            }
            self.feed_page()?;
        }

        Ok(written / CHANNELS)
    }

    /// Read ahead and hand the decoder its next page, growing the chunk until
    /// a whole page fits.
    fn feed_page(&mut self) -> Result<()> {
        let mut stream = self.stream.lock();
        let offset = stream.tell()?;

        loop {
            let read = stream.read(&mut self.chunk)?;
            if read == 0 {
                self.finished = true;
                return Ok(());
            }

            match self.decoder.push_page(&self.chunk[..read])? {
                PushStep::Consumed(used) | PushStep::Skipped(used) => {
                    stream.seek(offset + used as u64)?;
                    if self.chunk.len() > MIN_CHUNK_BYTES {
                        self.chunk.truncate(MIN_CHUNK_BYTES);
                    }
                    return Ok(());
                }
                PushStep::NeedMoreData if read < self.chunk.len() => {
                    debug!("vorbis stream ends inside a page, {read} trailing bytes ignored");
                    self.finished = true;
                    return Ok(());
                }
                PushStep::NeedMoreData => {
                    let grown = self.chunk.len() * 2;
                    if grown > MIN_CHUNK_BYTES * MAX_CHUNK_FACTOR {
                        return Err(Error::AudioDecode(
                            "vorbis: no progress with a full read-ahead chunk, file is corrupt"
                                .to_string(),
                        ));
                    }
                    self.chunk.resize(grown, 0);
                    stream.seek(offset)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carillon_core::{MemoryVfs, Vfs};
    use ogg::{PacketWriteEndInfo, PacketWriter};
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Stereo, 44.1 kHz, 20 pages. The headers end at byte 4388 and the
    /// last page has granule position 330095.
    const STEREO_OGG: &[u8] = include_bytes!("../../testdata/stereo.ogg");
    const STEREO_HEADER_BYTES: u64 = 4388;
    const STEREO_LAST_GRANULE: usize = 330_095;
    /// Start of the seventh page.
    const STEREO_PAGE_BOUNDARY: usize = 21_791;

    fn shared(vfs: &MemoryVfs, path: &str) -> SharedStream {
        Arc::new(Mutex::new(vfs.open(path).unwrap()))
    }

    /// Pages of stream 1; `breaks` ends a page after the packet at each index.
    fn ogg_pages(packets: &[&[u8]], breaks: &[usize]) -> Vec<u8> {
        let mut writer = PacketWriter::new(Vec::new());
        for (i, packet) in packets.iter().enumerate() {
            let end = if breaks.contains(&i) || i + 1 == packets.len() {
                PacketWriteEndInfo::EndPage
            } else {
                PacketWriteEndInfo::NormalPacket
            };
            writer
                .write_packet(packet.to_vec().into_boxed_slice(), 1, end, 0)
                .unwrap();
        }
        writer.into_inner()
    }

    fn probe_bytes(name: &str, bytes: Vec<u8>) -> (MemoryVfs, Result<VorbisStream>) {
        let vfs = MemoryVfs::new();
        let len = bytes.len() as u64;
        vfs.insert(name, bytes);
        let stream = VorbisStream::probe(shared(&vfs, name), Some(len));
        (vfs, stream)
    }

    /// Decode to the end, returning the frame count and the loudest sample.
    fn decode_all(stream: &mut VorbisStream) -> Result<(usize, i16)> {
        let mut block = vec![0i16; 4096];
        let mut frames = 0;
        let mut peak = 0i16;
        loop {
            let n = stream.read_frames(&mut block)?;
            if n == 0 {
                return Ok((frames, peak));
            }
            frames += n;
            for &sample in &block[..n * CHANNELS] {
                peak = peak.max(sample.saturating_abs());
            }
        }
    }

    fn with_garbage(at: usize, len: usize) -> Vec<u8> {
        let mut bytes = STEREO_OGG[..at].to_vec();
        bytes.resize(at + len, 0x55);
        bytes.extend_from_slice(&STEREO_OGG[at..]);
        bytes
    }

    #[test]
    fn test_open_needs_more_data_on_short_prefix() {
        let page = ogg_pages(&[b"\x01vorbis"], &[]);
        assert!(matches!(
            VorbisPushDecoder::open(&page[..10]),
            PushOpen::NeedMoreData
        ));
        assert!(matches!(
            VorbisPushDecoder::open(&page[..PAGE_HEADER_BYTES + 1]),
            PushOpen::NeedMoreData
        ));
        // One complete page but only one of three header packets.
        assert!(matches!(
            VorbisPushDecoder::open(&page),
            PushOpen::NeedMoreData
        ));
    }

    #[test]
    fn test_open_rejects_non_vorbis_ogg() {
        let page = ogg_pages(&[b"OpusHead", b"OpusTags", b"more"], &[]);
        assert!(matches!(
            VorbisPushDecoder::open(&page),
            PushOpen::Invalid(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_open_rejects_stream_without_first_page() {
        // Drop the 29-byte first page holding packet "a".
        let pages = ogg_pages(&[b"a", b"b", b"c", b"d"], &[0]);
        assert_eq!(&pages[29..33], CAPTURE_PATTERN);
        assert!(matches!(
            VorbisPushDecoder::open(&pages[29..]),
            PushOpen::Invalid(_)
        ));
    }

    #[test]
    fn test_open_rejects_bad_checksum() {
        let mut page = ogg_pages(&[b"a", b"b", b"c"], &[]);
        let last = page.len() - 1;
        page[last] ^= 0xFF;
        assert!(matches!(
            VorbisPushDecoder::open(&page),
            PushOpen::Invalid(_)
        ));
    }

    #[test]
    fn test_probe_rejects_riff_immediately() {
        let (_, result) = probe_bytes("a.wav", b"RIFF\x24\x00\x00\x00WAVEfmt ".to_vec());
        assert!(matches!(result, Err(Error::UnsupportedFormat(_))));
    }

    #[test]
    fn test_probe_grows_prefix_until_file_is_exhausted() {
        // A large first page that is not Vorbis: the probe has to read past
        // the initial prefix before it can say so.
        let page = ogg_pages(&[&[0u8; 2000], b"x", b"y"], &[]);
        let (vfs, result) = probe_bytes("big.ogg", page);
        assert!(matches!(result, Err(Error::UnsupportedFormat(_))));
        // Every attempt rewinds to the start.
        let seeks = vfs.seeks("big.ogg");
        assert!(seeks.len() > 1);
        assert!(seeks.iter().all(|&offset| offset == 0));
    }

    #[test]
    fn test_truncated_headers_fail_cleanly() {
        let (_, result) = probe_bytes("short.ogg", ogg_pages(&[b"\x01vorbis"], &[]));
        assert!(result.is_err());
    }

    #[test]
    fn test_stream_starts_after_headers() {
        let (vfs, result) = probe_bytes("stereo.ogg", STEREO_OGG.to_vec());
        let stream = result.unwrap();
        assert_eq!(stream.sample_rate(), 44100);

        let seeks = vfs.seeks("stereo.ogg");
        assert_eq!(seeks.last(), Some(&STEREO_HEADER_BYTES));
        assert!(seeks[..seeks.len() - 1].iter().all(|&offset| offset == 0));
        assert_eq!(stream.stream.lock().tell().unwrap(), STEREO_HEADER_BYTES);
    }

    #[test]
    fn test_decodes_stereo_file_to_the_end() {
        let (_, result) = probe_bytes("stereo.ogg", STEREO_OGG.to_vec());
        let mut stream = result.unwrap();
        let (frames, peak) = decode_all(&mut stream).unwrap();

        // The final packet is played in full, so the count may run past the
        // last granule position by up to half a long block.
        assert!(frames >= STEREO_LAST_GRANULE - 2048, "{frames} frames");
        assert!(frames <= STEREO_LAST_GRANULE + 2048, "{frames} frames");
        assert!(peak > 100);

        // End of stream is sticky.
        let mut block = [0i16; 64];
        assert_eq!(stream.read_frames(&mut block).unwrap(), 0);
    }

    #[test]
    fn test_garbage_between_pages_is_skipped() {
        let (_, clean) = probe_bytes("clean.ogg", STEREO_OGG.to_vec());
        let (expected, _) = decode_all(&mut clean.unwrap()).unwrap();

        let (_, result) = probe_bytes("dirty.ogg", with_garbage(STEREO_PAGE_BOUNDARY, 3000));
        let (frames, _) = decode_all(&mut result.unwrap()).unwrap();
        assert_eq!(frames, expected);
    }

    #[test]
    fn test_long_garbage_run_is_corrupt() {
        let bytes = with_garbage(STEREO_PAGE_BOUNDARY, 100_000);
        let (_, result) = probe_bytes("corrupt.ogg", bytes);
        let mut stream = result.unwrap();

        let err = decode_all(&mut stream).unwrap_err();
        assert!(matches!(err, Error::AudioDecode(_)));
        assert!(err.to_string().contains("no progress"), "{err}");
    }

    #[test]
    fn test_truncated_last_page_ends_stream() {
        let bytes = STEREO_OGG[..STEREO_OGG.len() - 500].to_vec();
        let (_, result) = probe_bytes("cut.ogg", bytes);
        let (frames, _) = decode_all(&mut result.unwrap()).unwrap();
        // Everything up to the cut page is still decoded.
        assert!(frames >= 316_736 - 2048, "{frames} frames");
        assert!(frames < STEREO_LAST_GRANULE, "{frames} frames");
    }
}
