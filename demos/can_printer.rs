use panda::StreamExt;

#[tokio::main]
async fn main() {
    panda::logging::init();

    let adapter = panda::can::get_adapter().unwrap();
    let mut stream = adapter.recv();

    while let Some(frame) = stream.next().await {
        let id: u32 = frame.id.into();
        println!("[{}]\t0x{:x}\t{}", frame.record_bus(), id, hex::encode(frame.data));
    }
}
