//! Firmware download into the inactive slot.

use core::ops::Range;

use embassy_net::tcp::TcpSocket;
use embassy_time::Duration;
use embedded_io_async::Write;
use esp_storage::FlashStorage;
use shared::http::{HttpError, ResponseHead, Url};
use shared::ota::{ImageWriter, OtaError, Otadata, PartitionLayout, Slot};
use shared::FirmwareUpdate;

use crate::net::{self, NetStack};

const CHUNK_LEN: usize = 1024;
const REQUEST_LEN: usize = 512;

pub const SOCKET_BUFFER_LEN: usize = 4096;

/// HTTP download of one image, streamed into flash as it arrives.
pub struct Download<'a> {
    socket: TcpSocket<'a>,
    writer: ImageWriter<FlashStorage>,
    otadata: Otadata,
    layout: PartitionLayout,
    slot: Slot,
    buffer: [u8; CHUNK_LEN],
    /// Body bytes received together with the response head
    pending: Range<usize>,
}

impl<'a> Download<'a> {
    /// Requests the image and prepares the inactive slot.
    pub async fn start(
        stack: &'static NetStack,
        rx_buffer: &'a mut [u8],
        tx_buffer: &'a mut [u8],
        update: &FirmwareUpdate,
        layout: PartitionLayout,
    ) -> Result<Download<'a>, OtaError> {
        let url = Url::parse(&update.url)?;
        let address = net::resolve(stack, url.host)
            .await
            .map_err(|_| OtaError::Network)?;

        let mut socket = TcpSocket::new(stack, rx_buffer, tx_buffer);
        socket.set_timeout(Some(Duration::from_secs(10)));
        socket
            .connect((address, url.port))
            .await
            .map_err(|_| OtaError::Network)?;

        let request = url.get_request::<REQUEST_LEN>()?;
        socket
            .write_all(request.as_bytes())
            .await
            .map_err(|_| OtaError::Network)?;

        let mut buffer = [0u8; CHUNK_LEN];
        let mut received = 0;
        let head = loop {
            if received == buffer.len() {
                return Err(HttpError::InvalidResponse.into());
            }
            let n = socket
                .read(&mut buffer[received..])
                .await
                .map_err(|_| OtaError::Network)?;
            if n == 0 {
                return Err(HttpError::InvalidResponse.into());
            }
            received += n;
            if let Some(head) = ResponseHead::parse(&buffer[..received])? {
                break head;
            }
        };
        head.ensure_ok()?;
        if head.content_length.is_some_and(|length| length != update.size) {
            defmt::warn!(
                "Server announced {} bytes, expecting {}",
                head.content_length,
                update.size
            );
        }

        let mut flash = FlashStorage::new();
        let otadata = Otadata::read(&mut flash, &layout)?;
        let slot = otadata.target_slot();
        defmt::info!("Writing firmware {=str} to {}", update.version.as_str(), slot);
        let writer = ImageWriter::new(flash, &layout, slot, update.size)?;

        Ok(Self {
            socket,
            writer,
            otadata,
            layout,
            slot,
            buffer,
            pending: head.len..received,
        })
    }

    /// Receives more of the image.
    ///
    /// Returns the progress percentage once per reported step, `None` when the image is complete
    /// or the server closed the connection.
    pub async fn advance(&mut self) -> Result<Option<u8>, OtaError> {
        if !self.pending.is_empty() {
            let pending = core::mem::replace(&mut self.pending, 0..0);
            if let Some(percent) = self.writer.write(&self.buffer[pending])? {
                return Ok(Some(percent));
            }
        }

        while self.writer.progress().percent() < 100 {
            let n = self
                .socket
                .read(&mut self.buffer)
                .await
                .map_err(|_| OtaError::Network)?;
            if n == 0 {
                break;
            }
            if let Some(percent) = self.writer.write(&self.buffer[..n])? {
                return Ok(Some(percent));
            }
        }
        Ok(None)
    }

    /// Flushes the image and selects its slot for the next boot.
    pub fn finish(self) -> Result<Slot, OtaError> {
        let Self {
            socket,
            writer,
            mut otadata,
            layout,
            slot,
            ..
        } = self;
        drop(socket);

        let mut flash = writer.finish()?;
        otadata.activate(&mut flash, &layout, slot)?;
        Ok(slot)
    }
}
