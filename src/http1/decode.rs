/*
 * Copyright (C) 2020-2023 Fanout, Inc.
 * Copyright (C) 2024 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::http1::protocol::Error;
use std::io;
use std::ops::Range;
use std::str;

// decodes entity bytes after transfer decoding. the parser applies no
// decoder by default, which is the identity encoding. callers inject
// implementations of this trait to layer in gzip/deflate etc
pub trait ContentDecode {
    fn decode(&mut self, src: &[u8], dest: &mut Vec<u8>) -> Result<(), io::Error>;
}

// caller-provided transfer decoding, used for transfer codings the
// core does not know. follows the same step conventions as the
// built-in decoders
pub trait TransferDecode {
    fn decode(&mut self, src: &[u8]) -> Result<DecodeStep, Error>;
}

// one step of transfer decoding over the unconsumed input. ranges are
// relative to the examined slice. consumed counts bytes the caller must
// advance past, and always covers any returned body range
pub enum DecodeStep {
    // body bytes, more of the same chunk/stream expected
    Data {
        body: Range<usize>,
        consumed: usize,
    },

    // one full chunk, a size line follows (chunked only)
    Boundary {
        body: Range<usize>,
        consumed: usize,
    },

    // end of the body. bytes past consumed are residual, possibly
    // belonging to a pipelined successor message
    Finished {
        body: Option<Range<usize>>,
        consumed: usize,
    },

    // cannot progress without more input
    NeedBytes {
        consumed: usize,
    },
}

pub enum TransferDecoder {
    // body is exactly total bytes, streamed as it arrives
    Identity { streamed: usize, total: usize },

    // left=None means a size line is expected next
    Chunked { left: Option<usize>, size: usize },

    // response with no framing headers: body runs until the caller
    // signals end of input
    CloseDelimited,

    // injected decoder for a transfer coding the core does not know
    Custom(Box<dyn TransferDecode>),
}

impl TransferDecoder {
    pub fn decode(&mut self, src: &[u8]) -> Result<DecodeStep, Error> {
        match self {
            Self::Identity { streamed, total } => {
                if src.is_empty() {
                    return Ok(DecodeStep::NeedBytes { consumed: 0 });
                }

                let left = *total - *streamed;

                if src.len() < left {
                    *streamed += src.len();

                    Ok(DecodeStep::Data {
                        body: 0..src.len(),
                        consumed: src.len(),
                    })
                } else {
                    *streamed = *total;

                    Ok(DecodeStep::Finished {
                        body: Some(0..left),
                        consumed: left,
                    })
                }
            }
            Self::Chunked { left, size } => {
                let mut pos = 0;

                loop {
                    match *left {
                        None => {
                            let line_end = match find_crlf(&src[pos..]) {
                                Some(x) => x,
                                None => return Ok(DecodeStep::NeedBytes { consumed: pos }),
                            };

                            let n = parse_chunk_size(&src[pos..(pos + line_end)])?;

                            pos += line_end + 2;

                            if n == 0 {
                                return Ok(DecodeStep::Finished {
                                    body: None,
                                    consumed: pos,
                                });
                            }

                            *left = Some(n);
                            *size = n;
                        }
                        Some(n) => {
                            if src.len() - pos < n + 2 {
                                return Ok(DecodeStep::NeedBytes { consumed: pos });
                            }

                            if &src[(pos + n)..(pos + n + 2)] != b"\r\n" {
                                return Err(Error::InvalidChunkSuffix);
                            }

                            *left = None;

                            return Ok(DecodeStep::Boundary {
                                body: pos..(pos + n),
                                consumed: pos + n + 2,
                            });
                        }
                    }
                }
            }
            Self::CloseDelimited => {
                if src.is_empty() {
                    return Ok(DecodeStep::NeedBytes { consumed: 0 });
                }

                Ok(DecodeStep::Data {
                    body: 0..src.len(),
                    consumed: src.len(),
                })
            }
            Self::Custom(decoder) => decoder.decode(src),
        }
    }
}

pub fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(2).position(|w| w == b"\r\n")
}

// size-in-hex, optionally followed by ;extensions which are discarded
fn parse_chunk_size(line: &[u8]) -> Result<usize, Error> {
    let token = match line.iter().position(|&b| b == b';') {
        Some(pos) => &line[..pos],
        None => line,
    };

    let token = trim_ascii(token);

    if token.is_empty() || !token.iter().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidChunkSize);
    }

    // valid utf-8 per the check above
    let s = str::from_utf8(token).unwrap();

    usize::from_str_radix(s, 16).map_err(|_| Error::InvalidChunkSize)
}

pub fn trim_ascii(src: &[u8]) -> &[u8] {
    let start = match src.iter().position(|b| !b.is_ascii_whitespace()) {
        Some(pos) => pos,
        None => return &src[..0],
    };

    let end = src.iter().rposition(|b| !b.is_ascii_whitespace()).unwrap();

    &src[start..(end + 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_of(step: &DecodeStep) -> Option<Range<usize>> {
        match step {
            DecodeStep::Data { body, .. } => Some(body.clone()),
            DecodeStep::Boundary { body, .. } => Some(body.clone()),
            DecodeStep::Finished { body, .. } => body.clone(),
            DecodeStep::NeedBytes { .. } => None,
        }
    }

    fn consumed_of(step: &DecodeStep) -> usize {
        match step {
            DecodeStep::Data { consumed, .. } => *consumed,
            DecodeStep::Boundary { consumed, .. } => *consumed,
            DecodeStep::Finished { consumed, .. } => *consumed,
            DecodeStep::NeedBytes { consumed } => *consumed,
        }
    }

    #[test]
    fn test_identity() {
        struct Test {
            name: &'static str,
            streamed: usize,
            total: usize,
            src: &'static [u8],
            body: Option<Range<usize>>,
            consumed: usize,
            finished: bool,
        }

        let tests = [
            Test {
                name: "empty",
                streamed: 0,
                total: 5,
                src: b"",
                body: None,
                consumed: 0,
                finished: false,
            },
            Test {
                name: "partial",
                streamed: 0,
                total: 5,
                src: b"hel",
                body: Some(0..3),
                consumed: 3,
                finished: false,
            },
            Test {
                name: "resume-exact",
                streamed: 3,
                total: 5,
                src: b"lo",
                body: Some(0..2),
                consumed: 2,
                finished: true,
            },
            Test {
                name: "overrun",
                streamed: 0,
                total: 5,
                src: b"helloGET /",
                body: Some(0..5),
                consumed: 5,
                finished: true,
            },
        ];

        for test in tests.iter() {
            let mut d = TransferDecoder::Identity {
                streamed: test.streamed,
                total: test.total,
            };

            let step = d.decode(test.src).unwrap();

            assert_eq!(body_of(&step), test.body, "test={}", test.name);
            assert_eq!(consumed_of(&step), test.consumed, "test={}", test.name);
            assert_eq!(
                matches!(step, DecodeStep::Finished { .. }),
                test.finished,
                "test={}",
                test.name
            );
        }
    }

    #[test]
    fn test_chunked() {
        struct Test {
            name: &'static str,
            src: &'static [u8],
            body: Option<Range<usize>>,
            consumed: usize,
            finished: bool,
        }

        let tests = [
            Test {
                name: "size-line-incomplete",
                src: b"3",
                body: None,
                consumed: 0,
                finished: false,
            },
            Test {
                name: "payload-incomplete",
                src: b"3\r\nab",
                body: None,
                consumed: 3,
                finished: false,
            },
            Test {
                name: "suffix-incomplete",
                src: b"3\r\nabc\r",
                body: None,
                consumed: 3,
                finished: false,
            },
            Test {
                name: "one-chunk",
                src: b"3\r\nabc\r\n",
                body: Some(3..6),
                consumed: 8,
                finished: false,
            },
            Test {
                name: "extensions-discarded",
                src: b"3;name=val\r\nabc\r\n",
                body: Some(12..15),
                consumed: 17,
                finished: false,
            },
            Test {
                name: "terminator",
                src: b"0\r\n\r\n",
                body: None,
                consumed: 3,
                finished: true,
            },
            Test {
                name: "hex-size",
                src: b"A\r\n0123456789\r\n",
                body: Some(3..13),
                consumed: 15,
                finished: false,
            },
        ];

        for test in tests.iter() {
            let mut d = TransferDecoder::Chunked {
                left: None,
                size: 0,
            };

            let step = d.decode(test.src).unwrap();

            assert_eq!(body_of(&step), test.body, "test={}", test.name);
            assert_eq!(consumed_of(&step), test.consumed, "test={}", test.name);
            assert_eq!(
                matches!(step, DecodeStep::Finished { .. }),
                test.finished,
                "test={}",
                test.name
            );
        }
    }

    #[test]
    fn test_chunked_resume_mid_chunk() {
        let mut d = TransferDecoder::Chunked {
            left: None,
            size: 0,
        };

        // size line consumed even though the payload hasn't arrived
        let step = d.decode(b"5\r\nhe").unwrap();
        assert!(matches!(step, DecodeStep::NeedBytes { consumed: 3 }));

        // re-driven with the size line already gone
        let step = d.decode(b"hello\r\n4\r\n").unwrap();
        match step {
            DecodeStep::Boundary { body, consumed } => {
                assert_eq!(body, 0..5);
                assert_eq!(consumed, 7);
            }
            _ => panic!("expected boundary"),
        }
    }

    #[test]
    fn test_chunked_errors() {
        struct Test {
            name: &'static str,
            src: &'static [u8],
            err: Error,
        }

        let tests = [
            Test {
                name: "not-hex",
                src: b"zz\r\n",
                err: Error::InvalidChunkSize,
            },
            Test {
                name: "empty-size",
                src: b"\r\n",
                err: Error::InvalidChunkSize,
            },
            Test {
                name: "empty-size-with-extension",
                src: b";foo\r\n",
                err: Error::InvalidChunkSize,
            },
            Test {
                name: "size-overflow",
                src: b"ffffffffffffffffff\r\n",
                err: Error::InvalidChunkSize,
            },
            Test {
                name: "bad-suffix",
                src: b"3\r\nabcXY",
                err: Error::InvalidChunkSuffix,
            },
        ];

        for test in tests.iter() {
            let mut d = TransferDecoder::Chunked {
                left: None,
                size: 0,
            };

            let r = d.decode(test.src);

            match r {
                Err(e) => assert_eq!(
                    std::mem::discriminant(&e),
                    std::mem::discriminant(&test.err),
                    "test={}",
                    test.name
                ),
                Ok(_) => panic!("expected error: test={}", test.name),
            }
        }
    }

    #[test]
    fn test_close_delimited() {
        let mut d = TransferDecoder::CloseDelimited;

        let step = d.decode(b"").unwrap();
        assert!(matches!(step, DecodeStep::NeedBytes { consumed: 0 }));

        let step = d.decode(b"anything").unwrap();
        match step {
            DecodeStep::Data { body, consumed } => {
                assert_eq!(body, 0..8);
                assert_eq!(consumed, 8);
            }
            _ => panic!("expected data"),
        }
    }

    #[test]
    fn test_trim_ascii() {
        assert_eq!(trim_ascii(b""), b"");
        assert_eq!(trim_ascii(b"   "), b"");
        assert_eq!(trim_ascii(b"abc"), b"abc");
        assert_eq!(trim_ascii(b"  abc\t "), b"abc");
    }
}
