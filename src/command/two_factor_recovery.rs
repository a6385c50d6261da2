//! Interactive regeneration of two-factor recovery codes.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use crate::gitlabnet::two_factor_recovery::Client;

/// Ask for confirmation on `input`, then print the regenerated codes (or the
/// reason they could not be generated) on `output`.
pub async fn execute<R, W>(client: &Client, key_id: &str, input: &mut R, output: &mut W) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if can_continue(input, output).await? {
        display_recovery_codes(client, key_id, output).await?;
    } else {
        output
            .write_all(b"\nNew recovery codes have *not* been generated. Existing codes will remain valid.\n")
            .await?;
    }
    output.flush().await
}

async fn can_continue<R, W>(input: &mut R, output: &mut W) -> io::Result<bool>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    output
        .write_all(b"Are you sure you want to generate new two-factor recovery codes?\n")
        .await?;
    output
        .write_all(b"Any existing recovery codes you saved will be invalidated. (yes/no)\n")
        .await?;
    output.flush().await?;

    let mut answer = String::new();
    input.read_line(&mut answer).await?;
    Ok(answer.split_whitespace().next() == Some("yes"))
}

async fn display_recovery_codes<W>(client: &Client, key_id: &str, output: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result = if key_id.is_empty() {
        Err("Failed to get key id".to_string())
    } else {
        client.get_recovery_codes(key_id).await.map_err(|e| e.to_string())
    };

    let text = match result {
        Ok(codes) => {
            info!(key_id, count = codes.len(), "two-factor recovery codes regenerated");
            format!(
                "\nYour two-factor authentication recovery codes are:\n\n{}\n\n\
                 During sign in, use one of the codes above when prompted for\n\
                 your two-factor code. Then, visit your Profile Settings and add\n\
                 a new device so you do not lose access to your account again.\n",
                codes.join("\n")
            )
        }
        Err(message) => {
            warn!(key_id, error = %message, "failed to regenerate two-factor recovery codes");
            format!("\nAn error occurred while trying to generate new recovery codes.\n{message}\n")
        }
    };
    output.write_all(text.as_bytes()).await
}
