//! Stateful zlib header-block compressor/decompressor seeded with the SPDY
//! dictionary. One compressor drives all outbound header blocks and one
//! decompressor all inbound ones, for the life of a connection.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::ConnectionError;
use crate::frame::control::{HeaderList, decode_header_block, encode_header_block};
use crate::version::ProtocolVersion;

/// The dictionary SPDY/2 and SPDY/3 both seed their header zlib streams
/// with. It is not meant to be human-readable; it is simply a corpus of
/// strings that occur often in HTTP header blocks (method names, common
/// header names and values, status lines, weekday/month names) so that the
/// very first header block on a connection still compresses well.
pub const SPDY_DICTIONARY: &[u8] = b"\
optionsgetheadpostputdeletetraceacceptaccept-charsetaccept-encodingaccept-\
languageauthorizationexpectfromhostif-modified-sinceif-matchif-none-matchif-rangeif-unmodifiedsince\
max-forwardsproxy-authorizationrangerefererteuser-agent10010120020120220320420520630030130230330430\
530630740040140240340440540640740840940040140240340440440540640740840940040140240340440540640740840\
9410411412413414415416417500501502503504505accept-rangesageetaglocationproxy-authenticatepublicretr\
y-afterservervarywarningwww-authenticateallowcontent-basecontent-encodingcache-controlconnectiondat\
etrailertransfer-encodingupgradeviawarningcontent-languagecontent-lengthcontent-locationcontent-md5c\
ontent-rangecontent-typeetagexpireslast-modifiedset-cookieMondayTuesdayWednesdayThursdayFridaySaturd\
aySundayJanFebMarAprMayJunJulAugSepOctNovDecchunkedtext/htmlimage/pngimage/jpgimage/gifapplication/x\
mlapplication/xhtmltext/plainpublicmax-agecharset=iso-8859-1utf-8gzipdeflateHTTP/1.1statusversionurl\
\0";

/// Errors from the underlying zlib stream are collapsed into a single
/// string inside [`ConnectionError::HeaderCompression`]; there is nothing a
/// caller can usefully do beyond tearing down the connection (spec §7), so
/// there is no point in a richer error type here.
fn fail(msg: impl Into<String>) -> ConnectionError {
    ConnectionError::HeaderCompression(msg.into())
}

/// Bidirectional header-block codec for one connection (spec §4.A).
///
/// Compression and decompression are each stateful across the life of the
/// connection: encoding or decoding out of order, or dropping a block, would
/// desynchronize the zlib stream and corrupt every subsequent header block.
pub struct HeaderCodec {
    version: ProtocolVersion,
    compressor: Compress,
    decompressor: Decompress,
}

impl HeaderCodec {
    pub fn new(version: ProtocolVersion) -> Self {
        // Raw deflate, not zlib-wrapped: a zlib-format stream only accepts
        // a preset dictionary after the decompressor reports `Z_NEED_DICT`,
        // which requires a round of input first. SPDY's header codec needs
        // to prime both sides with the dictionary before any bytes flow,
        // so it runs deflate in raw mode (no header, no adler32 trailer),
        // where `set_dictionary` takes effect immediately on both ends.
        let mut compressor = Compress::new(Compression::default(), false);
        let mut decompressor = Decompress::new(false);
        let _ = compressor.set_dictionary(SPDY_DICTIONARY);
        let _ = decompressor.set_dictionary(SPDY_DICTIONARY);
        HeaderCodec {
            version,
            compressor,
            decompressor,
        }
    }

    /// Compresses an ordered header list into the bytes that go directly
    /// into a `SYN_STREAM`/`SYN_REPLY` frame body (after the frame's own
    /// fixed fields). The caller prepends the enclosing frame's header and
    /// any non-header fields; this returns only the compressed block.
    pub fn encode(&mut self, headers: &HeaderList) -> Result<Vec<u8>, ConnectionError> {
        let plain = encode_header_block(self.version, headers);
        let in_start = self.compressor.total_in();
        let out_start = self.compressor.total_out();
        let mut out = Vec::with_capacity(plain.len() + 32);
        loop {
            let consumed = (self.compressor.total_in() - in_start) as usize;
            let produced = (self.compressor.total_out() - out_start) as usize;
            out.resize(produced + 4096, 0);
            let status = self
                .compressor
                .compress(&plain[consumed..], &mut out[produced..], FlushCompress::Sync)
                .map_err(|e| fail(e.to_string()))?;
            out.truncate((self.compressor.total_out() - out_start) as usize);
            if (self.compressor.total_in() - in_start) as usize >= plain.len() {
                break;
            }
            if status == Status::BufError {
                return Err(fail("zlib made no progress compressing a header block"));
            }
        }
        Ok(out)
    }

    /// Decompresses a raw header block (as sliced out of a `SYN_REPLY`
    /// frame body by the framer) back into an ordered header list.
    pub fn decode(&mut self, block: &[u8]) -> Result<HeaderList, ConnectionError> {
        let in_start = self.decompressor.total_in();
        let out_start = self.decompressor.total_out();
        let mut out = Vec::with_capacity(block.len() * 4);
        loop {
            let consumed = (self.decompressor.total_in() - in_start) as usize;
            let produced = (self.decompressor.total_out() - out_start) as usize;
            out.resize(produced + 4096, 0);
            let status = self
                .decompressor
                .decompress(&block[consumed..], &mut out[produced..], FlushDecompress::Sync)
                .map_err(|e| fail(e.to_string()))?;
            out.truncate((self.decompressor.total_out() - out_start) as usize);
            if status == Status::StreamEnd || (self.decompressor.total_in() - in_start) as usize >= block.len() {
                break;
            }
            if status == Status::BufError {
                return Err(fail("zlib made no progress decompressing a header block"));
            }
        }
        decode_header_block(self.version, &out).map_err(fail)
    }
}
