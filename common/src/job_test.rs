use super::*;

fn segment(start: f64, end: f64, confidence: f64) -> Segment {
    Segment::new("hello", start, end, confidence).unwrap()
}

#[test]
fn test_segment_rejects_negative_start() {
    assert_eq!(
        Segment::new("x", -0.5, 1.0, 0.5),
        Err(SegmentError::NegativeStart(-0.5))
    );
}

#[test]
fn test_segment_rejects_end_before_start() {
    assert!(matches!(
        Segment::new("x", 2.0, 1.0, 0.5),
        Err(SegmentError::EndBeforeStart { .. })
    ));
}

#[test]
fn test_segment_rejects_confidence_out_of_range() {
    assert_eq!(
        Segment::new("x", 0.0, 1.0, 1.5),
        Err(SegmentError::ConfidenceOutOfRange(1.5))
    );
    assert!(Segment::new("x", 0.0, 1.0, f64::NAN).is_err());
}

#[test]
fn test_segment_zero_length_is_valid() {
    let seg = segment(1.0, 1.0, 0.0);
    assert_eq!(seg.start_time(), seg.end_time());
}

#[test]
fn test_segment_deserialization_validates() {
    let json = r#"{"text":"hi","start_time":3.0,"end_time":1.0,"confidence":0.9}"#;
    let err = serde_json::from_str::<Segment>(json).unwrap_err();
    assert!(err.to_string().contains("before start time"));
}

#[test]
fn test_segment_optional_fields_survive_wire() {
    let seg = segment(0.0, 1.2, 0.8)
        .with_speaker("spk_1")
        .with_language("en-US");
    let json = serde_json::to_string(&seg).unwrap();
    let back: Segment = serde_json::from_str(&json).unwrap();
    assert_eq!(back.speaker_id(), Some("spk_1"));
    assert_eq!(back.language(), Some("en-US"));
}

#[test]
fn test_transcript_derived_values() {
    let mut transcript = Transcript {
        segments: vec![segment(0.0, 2.0, 0.5), segment(2.0, 4.5, 1.0)],
        full_text: "hello hello".to_string(),
        detected_language: "en".to_string(),
        ..Transcript::default()
    };
    transcript.timings.insert(TIMING_RECOGNITION.to_string(), 1.5);
    transcript.timings.insert(TIMING_SERIALIZATION.to_string(), 0.25);

    assert!((transcript.audio_duration() - 4.5).abs() < f64::EPSILON);
    assert!((transcript.confidence_average() - 0.75).abs() < f64::EPSILON);
    assert!((transcript.processing_time() - 1.75).abs() < f64::EPSILON);

    transcript.timings.insert(TIMING_TOTAL.to_string(), 2.0);
    assert!((transcript.processing_time() - 2.0).abs() < f64::EPSILON);
}

#[test]
fn test_empty_transcript_has_zero_averages() {
    let transcript = Transcript::default();
    assert_eq!(transcript.audio_duration(), 0.0);
    assert_eq!(transcript.confidence_average(), 0.0);
}

#[test]
fn test_job_result_is_tagged() {
    let failure = JobResult::failure(FailureKind::Timeout, "too slow");
    let json = serde_json::to_value(&failure).unwrap();
    assert_eq!(json["status"], "failure");
    assert_eq!(json["kind"], "timeout");
    assert!(json.get("segments").is_none());

    let success = JobResult::Success(Transcript::default());
    let json = serde_json::to_value(&success).unwrap();
    assert_eq!(json["status"], "success");
    assert!(json.get("kind").is_none());
}

#[test]
fn test_user_message_hides_trace() {
    let failure =
        JobFailure::new(FailureKind::Crash, "boom").with_trace("at recognizer.rs:42");
    let message = failure.user_message();
    assert!(message.contains("boom"));
    assert!(!message.contains("recognizer.rs"));
}

#[test]
fn test_short_id() {
    assert_eq!(short_id("0123456789abcdef"), "01234567");
    assert_eq!(short_id("abc"), "abc");
    let job = Job::new("/tmp/a.wav", "auto", "deadbeefcafe", Duration::from_secs(1));
    assert_eq!(job.short_id(), "deadbeef");
}
