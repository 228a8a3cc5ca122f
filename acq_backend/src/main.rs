use acq_backend::store::Store;
use acq_backend::clock::TickTimer;

fn main() {
    let mut args = std::env::args().skip(1);
    let (Some(root), dir) = (args.next(), args.next()) else {
        eprintln!("usage: acq_backend_bin <store-root> [subdir]");
        std::process::exit(2);
    };
    let mut timer = TickTimer::new();
    let result = Store::open(&root).and_then(|store| {
        let handle = match &dir {
            Some(d) => store.get_handle(d)?,
            None => store.root(),
        };
        handle.read_log(true)
    });
    match result {
        Ok(entries) => {
            for entry in entries {
                println!(
                    "{:>16.3}  {:<24}  {:<8}  {}",
                    entry.timestamp,
                    entry.subdir.as_deref().unwrap_or("."),
                    entry.source.as_deref().unwrap_or("-"),
                    entry.message
                );
            }
            timer.tick_print("read log");
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
