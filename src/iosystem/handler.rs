//! Message loop of the I/O group in asynchronous sessions

use std::rc::Rc;

use crate::api::Pio;
use crate::buffer::{BufferChain, FlushTarget, flush_all};
use crate::error::{PioError, PioResult};
use crate::iosystem::{IoSystem, Msg, OpRequest};
use crate::storage::{IoFormat, nc};

impl Pio {
    /// Serve requests from the computational group until it finalizes
    ///
    /// Returns at once for synchronous sessions and on computational ranks.
    /// Failed operations are reported to the computational ranks through
    /// the settled outcome and the loop keeps going; only communication
    /// faults end it early. A request that cannot be decoded is answered
    /// with a failed outcome.
    pub fn serve(&mut self, iosysid: i32) -> PioResult<()> {
        let ios = self.session(iosysid)?;
        if !ios.is_async() || !ios.is_io_task() {
            return Ok(());
        }
        tracing::info!("I/O rank {:?} serving I/O system {}", ios.io_rank(), iosysid);

        loop {
            let msg = ios.next_message()?;
            tracing::trace!("Received {:?}", msg);
            if msg == Msg::Exit {
                tracing::info!("I/O system {} asked to exit", iosysid);
                return Ok(());
            }
            let result = match OpRequest::decode(&ios.receive_from_comp()?) {
                Ok(request) => self.handle(&ios, msg, request),
                Err(e) => {
                    tracing::error!("Undecodable {:?} request: {}", msg, e);
                    self.reject(&ios, msg, PioError::UnsupportedFormat { code: nc::EINVAL })
                }
            };
            match result {
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::debug!("{:?} failed: {}", msg, e),
                Ok(()) => {}
            }
        }
    }

    fn handle(&mut self, ios: &Rc<IoSystem>, msg: Msg, request: OpRequest) -> PioResult<()> {
        match msg {
            Msg::CreateFile | Msg::OpenFile => {
                let Some(format) = request.io_format() else {
                    tracing::error!("Unknown format tag {}", request.format);
                    return self.reject(
                        ios,
                        msg,
                        PioError::UnsupportedFormat {
                            code: nc::EBADIOTYPE,
                        },
                    );
                };
                self.open_collective(
                    ios,
                    msg == Msg::CreateFile,
                    &request.path,
                    format,
                    request.mode,
                )
                .map(|_| ())
            }
            Msg::CloseFile => self.close_collective(ios, request.handle),
            Msg::Sync => self.sync_collective(ios, request.handle),
            Msg::DeleteFile => self.delete_collective(ios, &request.path),
            Msg::Exit => Ok(()),
        }
    }

    /// Take part in the collectives the computational ranks run for `msg`
    /// without touching any backend, then report `err` to them
    fn reject(&self, ios: &Rc<IoSystem>, msg: Msg, err: PioError) -> PioResult<()> {
        match msg {
            Msg::CreateFile | Msg::OpenFile => {
                ios.agree_file_id(self.next_file_id())?;
            }
            Msg::Sync => {
                // Drain the staged nodes the computational ranks send anyway
                let target = FlushTarget {
                    ios: ios.as_ref(),
                    dispatcher: None,
                    format: IoFormat::Classic,
                    fh: None,
                };
                let mut chain = BufferChain::new(1);
                flush_all(&target, &mut chain, self.pool(), false)?;
            }
            Msg::CloseFile | Msg::DeleteFile | Msg::Exit => {}
        }
        ios.settle(Err(err))
    }
}
