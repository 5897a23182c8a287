//! Stream adapter over the pull reader
use std::pin::Pin;
use std::task::{Context, Poll};

use arrow_array::RecordBatch;
use futures::future::BoxFuture;
use futures::{ready, Future, Stream};
use pin_project_lite::pin_project;

use crate::errors::CloudFetchError;
use crate::reader::CloudFetchReader;

/// The type of the elements returned by a [RecordBatchStream]
pub type RecordBatchStreamItem = Result<RecordBatch, CloudFetchError>;

type NextBatch = BoxFuture<'static, (CloudFetchReader, Result<Option<RecordBatch>, CloudFetchError>)>;

pin_project! {
    /// A [Stream] of record batches in chunk order
    ///
    /// Ends after the first error; the terminal error is yielded once.
    pub struct RecordBatchStream {
        #[pin]
        in_flight: Option<NextBatch>,
        reader: Option<CloudFetchReader>,
        is_closed: bool,
    }
}

impl RecordBatchStream {
    pub fn new(reader: CloudFetchReader) -> Self {
        Self {
            in_flight: None,
            reader: Some(reader),
            is_closed: false,
        }
    }
}

impl CloudFetchReader {
    /// Turns this reader into a [RecordBatchStream].
    pub fn into_stream(self) -> RecordBatchStream {
        RecordBatchStream::new(self)
    }
}

impl Stream for RecordBatchStream {
    type Item = RecordBatchStreamItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if *this.is_closed {
            return Poll::Ready(None);
        }

        loop {
            if let Some(in_flight) = this.in_flight.as_mut().as_pin_mut() {
                let (reader, item) = ready!(in_flight.poll(cx));
                this.in_flight.set(None);
                *this.reader = Some(reader);

                return match item {
                    Ok(Some(batch)) => Poll::Ready(Some(Ok(batch))),
                    Ok(None) => {
                        *this.is_closed = true;
                        Poll::Ready(None)
                    }
                    Err(err) => {
                        *this.is_closed = true;
                        Poll::Ready(Some(Err(err)))
                    }
                };
            }

            let mut reader = match this.reader.take() {
                Some(reader) => reader,
                None => {
                    *this.is_closed = true;
                    return Poll::Ready(None);
                }
            };
            this.in_flight.set(Some(Box::pin(async move {
                let item = reader.next_batch().await;
                (reader, item)
            })));
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, None)
    }
}
