macro_rules! id_gen {
    ($mod_name:ident) => {
        mod $mod_name {
            use std::sync::atomic::{AtomicUsize, Ordering};

            static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

            pub(crate) fn next() -> usize {
                NEXT_ID.fetch_add(1, Ordering::Relaxed)
            }
        }
    };
}

pub(crate) use id_gen;
