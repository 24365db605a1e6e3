//! Internal macros

/// Time `$body` and record the elapsed seconds into a
/// [`prometheus::HistogramVec`] under `$labels`.
///
/// Evaluates to the value of `$body`, so `?` inside it still
/// propagates from the enclosing function.
#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram
            .with_label_values($labels)
            .observe(now.elapsed().as_secs_f64());
        res
    }};
}
