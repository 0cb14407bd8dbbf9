use std::io::Write;

use chatterbox_tts_client::{SpeechEvent, SpeechStream, SynthesisRequest, TtsClient, DEFAULT_BASE_URL};
use chatterbox_tts_client::wav::WavBuilder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let text = std::io::read_to_string(std::io::stdin())?;
    let base_url = std::env::var("CHATTERBOX_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_owned());

    let client = match TtsClient::new(base_url) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let mut stream = match SpeechStream::open(&client, &SynthesisRequest::new(text)).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let mut builder = WavBuilder::new();
    while let Some(event) = stream.next_event().await {
        match event {
            Ok(SpeechEvent::Info { info, .. }) => builder.set_info(info),
            Ok(SpeechEvent::Delta { fragment, .. }) => builder.push(fragment.pcm),
            Ok(SpeechEvent::Done { .. }) => break,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        }
    }

    let wav = match builder.finish() {
        Ok(wav) => wav,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    std::io::stdout().write_all(wav.as_slice())?;

    Ok(())
}
